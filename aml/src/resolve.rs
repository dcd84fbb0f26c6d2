//! Resolution of namespace nodes to the values they hold.
//!
//! Resolving a node produces a new reference to its attached object, realizing deferred buffers and packages
//! on the way. Fields are the exception: reading one produces a new object each time.

use crate::{
    namespace::{NodeFlags, NodeHandle},
    object::{Object, ObjectRef, ObjectType, ReferenceKind},
    AmlError,
};
use log::trace;

#[derive(Clone, Debug)]
pub enum Resolved {
    /// Nodes that have no value semantics, such as devices and methods, resolve to themselves.
    Node(NodeHandle),
    Object(ObjectRef),
}

/// What resolution needs to know about a node. Taken as a snapshot, so the namespace is not locked over a
/// realization or field access.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub typ: ObjectType,
    pub flags: NodeFlags,
    pub object: Option<ObjectRef>,
    pub target: Option<NodeHandle>,
}

/// The collaborators of resolution: the namespace, the deferred-object realizer, and the field accessor.
pub trait ResolveContext {
    fn node_info(&self, node: NodeHandle) -> Result<NodeInfo, AmlError>;
    fn realize_package(&self, package: &ObjectRef) -> Result<(), AmlError>;
    fn realize_buffer(&self, buffer: &ObjectRef) -> Result<(), AmlError>;
    fn read_field(&self, field: &ObjectRef) -> Result<ObjectRef, AmlError>;
}

pub fn resolve_node_to_value<C>(context: &C, node: NodeHandle) -> Result<Resolved, AmlError>
where
    C: ResolveContext + ?Sized,
{
    let mut node = node;
    let mut info = context.node_info(node)?;

    // Only one level of aliasing is followed
    if matches!(info.typ, ObjectType::Alias | ObjectType::MethodAlias) {
        node = info.target.ok_or(AmlError::UninitializedNode)?;
        info = context.node_info(node)?;
    }

    if matches!(info.typ, ObjectType::Device | ObjectType::Thermal | ObjectType::Method)
        || info.flags.is_method_arg()
        || info.flags.is_method_local()
    {
        return Ok(Resolved::Node(node));
    }

    let object = info.object.ok_or(AmlError::UninitializedNode)?;
    let actual = object.typ();
    if actual != info.typ {
        return Err(AmlError::OperandTypeError { declared: info.typ, actual });
    }

    match info.typ {
        ObjectType::Package => {
            if !object.is_realized() {
                trace!("Realizing package at {:?}", node);
                context.realize_package(&object)?;
            }
            Ok(Resolved::Object(object))
        }
        ObjectType::Buffer => {
            if !object.is_realized() {
                trace!("Realizing buffer at {:?}", node);
                context.realize_buffer(&object)?;
            }
            Ok(Resolved::Object(object))
        }

        ObjectType::String
        | ObjectType::Integer
        | ObjectType::Mutex
        | ObjectType::Power
        | ObjectType::Processor
        | ObjectType::Event
        | ObjectType::Region => Ok(Resolved::Object(object)),

        ObjectType::BufferField | ObjectType::RegionField | ObjectType::BankField | ObjectType::IndexField => {
            Ok(Resolved::Object(context.read_field(&object)?))
        }

        ObjectType::LocalReference => {
            let kind = match *object.lock() {
                Object::Reference { kind, .. } => kind,
                _ => return Err(AmlError::OperandTypeError { declared: info.typ, actual }),
            };
            match kind {
                ReferenceKind::Table | ReferenceKind::RefOf | ReferenceKind::Index => Ok(Resolved::Object(object)),
                ReferenceKind::Name => Err(AmlError::OperandTypeError { declared: info.typ, actual }),
            }
        }

        _ => Err(AmlError::OperandTypeError { declared: info.typ, actual }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        namespace::{NameSeg, Namespace},
        object::{AmlSpan, Deferred, FieldFlags, FieldUnit, FieldUnitKind, ReferenceTarget},
        opcode::Opcode,
        table::OwnerId,
    };
    use alloc::{sync::Arc, vec, vec::Vec};
    use core::{cell::Cell, str::FromStr};
    use spinning_top::Spinlock;

    /// Resolves against a real namespace, but counts realizations and fakes field reads.
    struct Counting {
        namespace: Spinlock<Namespace>,
        realizations: Cell<usize>,
    }

    impl Counting {
        fn new() -> Counting {
            Counting { namespace: Spinlock::new(Namespace::new()), realizations: Cell::new(0) }
        }

        fn add(&self, name: &str, typ: ObjectType, object: Option<Object>) -> NodeHandle {
            let mut namespace = self.namespace.lock();
            let node = namespace.add_node(NodeHandle::ROOT, NameSeg::from_str(name).unwrap(), typ, OwnerId(1)).unwrap();
            if let Some(object) = object {
                namespace.attach_object(node, ObjectRef::new(object)).unwrap();
            }
            node
        }

        fn realize(&self, object: &ObjectRef) {
            self.realizations.set(self.realizations.get() + 1);
            match *object.lock() {
                Object::Package { ref mut elements, ref mut deferred } => {
                    *deferred = None;
                    elements.push(ObjectRef::new(Object::Integer(1)));
                }
                Object::Buffer { ref mut data, ref mut deferred } => {
                    *deferred = None;
                    data.push(0xff);
                }
                _ => (),
            }
        }
    }

    impl ResolveContext for Counting {
        fn node_info(&self, node: NodeHandle) -> Result<NodeInfo, AmlError> {
            let namespace = self.namespace.lock();
            let node = namespace.get(node)?;
            Ok(NodeInfo { typ: node.typ, flags: node.flags, object: node.object.clone(), target: node.target })
        }

        fn realize_package(&self, package: &ObjectRef) -> Result<(), AmlError> {
            self.realize(package);
            Ok(())
        }

        fn realize_buffer(&self, buffer: &ObjectRef) -> Result<(), AmlError> {
            self.realize(buffer);
            Ok(())
        }

        fn read_field(&self, _field: &ObjectRef) -> Result<ObjectRef, AmlError> {
            Ok(ObjectRef::new(Object::Integer(0xa5)))
        }
    }

    fn deferred() -> Option<Deferred> {
        let aml: Arc<[u8]> = Arc::from(&[0u8; 2][..]);
        Some(Deferred { span: AmlSpan { aml, start: 0, end: 2 }, scope: NodeHandle::ROOT, opcode: Opcode::Package })
    }

    fn object_of(resolved: Resolved) -> ObjectRef {
        match resolved {
            Resolved::Object(object) => object,
            Resolved::Node(node) => panic!("resolved to node {:?}", node),
        }
    }

    #[test]
    fn realization_happens_once() {
        let context = Counting::new();
        let package = Object::Package { elements: Vec::new(), deferred: deferred() };
        let node = context.add("PKG", ObjectType::Package, Some(package));
        let attached = context.node_info(node).unwrap().object.unwrap();
        // The node's own reference, plus the one we just took to look at it
        assert_eq!(attached.ref_count(), 2);
        drop(attached);

        let first = object_of(resolve_node_to_value(&context, node).unwrap());
        assert_eq!(first.ref_count(), 2);
        let second = object_of(resolve_node_to_value(&context, node).unwrap());
        assert_eq!(second.ref_count(), 3);

        assert!(first.ptr_eq(&second));
        assert_eq!(context.realizations.get(), 1);
        assert!(first.is_realized());
    }

    #[test]
    fn buffers_are_realized_too() {
        let context = Counting::new();
        let node = context.add("BUF", ObjectType::Buffer, Some(Object::Buffer { data: vec![], deferred: deferred() }));
        let buffer = object_of(resolve_node_to_value(&context, node).unwrap());
        assert!(matches!(*buffer.lock(), Object::Buffer { ref data, deferred: None } if data == &[0xff]));
        assert_eq!(context.realizations.get(), 1);
    }

    #[test]
    fn nodes_without_objects_are_uninitialized() {
        let context = Counting::new();
        let node = context.add("FOO", ObjectType::Integer, None);
        assert_eq!(resolve_node_to_value(&context, node).err(), Some(AmlError::UninitializedNode));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let context = Counting::new();
        let node = context.add("FOO", ObjectType::Integer, Some(Object::Integer(4)));
        context.namespace.lock().get_mut(node).unwrap().typ = ObjectType::String;
        assert_eq!(
            resolve_node_to_value(&context, node).err(),
            Some(AmlError::OperandTypeError { declared: ObjectType::String, actual: ObjectType::Integer })
        );
    }

    #[test]
    fn devices_and_aliases() {
        let context = Counting::new();
        let device = context.add("DEV0", ObjectType::Device, None);
        assert!(matches!(resolve_node_to_value(&context, device), Ok(Resolved::Node(node)) if node == device));

        let value = context.add("VAL", ObjectType::Integer, Some(Object::Integer(7)));
        let alias = context.add("ALI", ObjectType::Alias, None);
        context.namespace.lock().get_mut(alias).unwrap().target = Some(value);
        assert_eq!(object_of(resolve_node_to_value(&context, alias).unwrap()).to_integer(), Ok(7));

        let mut local = context.add("LOC", ObjectType::Integer, None);
        context.namespace.lock().get_mut(local).unwrap().flags.set_method_local(true);
        assert!(matches!(resolve_node_to_value(&context, local), Ok(Resolved::Node(_))));
        local = context.add("UNK", ObjectType::Any, Some(Object::Uninitialized));
        assert!(matches!(resolve_node_to_value(&context, local), Err(AmlError::OperandTypeError { .. })));
    }

    #[test]
    fn fields_produce_fresh_objects() {
        let context = Counting::new();
        let unit = FieldUnit {
            kind: FieldUnitKind::Normal { region: NodeHandle::ROOT },
            flags: FieldFlags(0),
            bit_index: 0,
            bit_length: 8,
        };
        let node = context.add("FLD", ObjectType::RegionField, Some(Object::FieldUnit(unit)));
        let first = object_of(resolve_node_to_value(&context, node).unwrap());
        let second = object_of(resolve_node_to_value(&context, node).unwrap());
        assert_eq!(first.to_integer(), Ok(0xa5));
        assert!(!first.ptr_eq(&second));
        assert_eq!(first.ref_count(), 1);
    }

    #[test]
    fn only_some_references_resolve() {
        let context = Counting::new();
        let target = ReferenceTarget::Node(NodeHandle::ROOT);
        let node = context.add(
            "REF",
            ObjectType::LocalReference,
            Some(Object::Reference { kind: ReferenceKind::RefOf, target: target.clone() }),
        );
        assert!(resolve_node_to_value(&context, node).is_ok());

        let named = context.add(
            "NAM",
            ObjectType::LocalReference,
            Some(Object::Reference { kind: ReferenceKind::Name, target }),
        );
        assert!(matches!(resolve_node_to_value(&context, named), Err(AmlError::OperandTypeError { .. })));
    }
}
