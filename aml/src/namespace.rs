use crate::{
    object::{MethodFlags, Object, ObjectRef, ObjectType},
    table::OwnerId,
    AmlError,
};
use alloc::{
    collections::{BTreeMap, BTreeSet},
    string::{String, ToString},
    sync::Arc,
    vec,
    vec::Vec,
};
use bit_field::BitField;
use core::{fmt, str, str::FromStr};
use log::trace;

/// A handle refers to a node of the namespace without borrowing it. Handles are never reused: the handle of a
/// removed node will never point at a new node, so cached handles are either valid or produce an error.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub const ROOT: NodeHandle = NodeHandle(0);
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct NodeFlags(pub u8);

impl NodeFlags {
    pub fn is_method_arg(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn set_method_arg(&mut self, value: bool) {
        self.0.set_bit(0, value);
    }

    pub fn is_method_local(&self) -> bool {
        self.0.get_bit(1)
    }

    pub fn set_method_local(&mut self, value: bool) {
        self.0.set_bit(1, value);
    }
}

#[derive(Debug)]
pub struct NamespaceNode {
    pub name: NameSeg,
    pub typ: ObjectType,
    pub parent: Option<NodeHandle>,
    pub children: BTreeMap<NameSeg, NodeHandle>,
    pub object: Option<ObjectRef>,
    pub flags: NodeFlags,
    pub owner_id: OwnerId,
    /// The node an `Alias` or `MethodAlias` node refers to.
    pub target: Option<NodeHandle>,
}

impl NamespaceNode {
    fn new(name: NameSeg, typ: ObjectType, parent: Option<NodeHandle>, owner_id: OwnerId) -> NamespaceNode {
        NamespaceNode {
            name,
            typ,
            parent,
            children: BTreeMap::new(),
            object: None,
            flags: NodeFlags::default(),
            owner_id,
            target: None,
        }
    }
}

pub struct Namespace {
    nodes: BTreeMap<NodeHandle, NamespaceNode>,
    /// Every node created by each owner. Rollback and unload walk only this set.
    owners: BTreeMap<OwnerId, BTreeSet<NodeHandle>>,
    next_handle: u32,
}

impl Namespace {
    /// Create a namespace containing the root node and the predefined objects. These are all owned by
    /// `OwnerId::ROOT`, which is never released.
    pub fn new() -> Namespace {
        let mut namespace = Namespace { nodes: BTreeMap::new(), owners: BTreeMap::new(), next_handle: 1 };
        let root = NamespaceNode::new(NameSeg::ROOT, ObjectType::Any, None, OwnerId::ROOT);
        namespace.nodes.insert(NodeHandle::ROOT, root);

        for (name, typ) in [
            (*b"_GPE", ObjectType::Any),
            (*b"_PR_", ObjectType::Any),
            (*b"_SB_", ObjectType::Device),
            (*b"_SI_", ObjectType::Any),
            (*b"_TZ_", ObjectType::Any),
        ] {
            namespace.insert_predefined(NameSeg(name), typ, None);
        }

        namespace.insert_predefined(NameSeg(*b"_GL_"), ObjectType::Mutex, Some(Object::Mutex { sync_level: 0 }));
        namespace.insert_predefined(
            NameSeg(*b"_OS_"),
            ObjectType::String,
            Some(Object::String("Microsoft Windows NT".to_string())),
        );
        namespace.insert_predefined(NameSeg(*b"_REV"), ObjectType::Integer, Some(Object::Integer(2)));
        namespace.insert_predefined(
            NameSeg(*b"_OSI"),
            ObjectType::Method,
            Some(Object::NativeMethod { f: Arc::new(osi), flags: MethodFlags::with_arg_count(1) }),
        );

        namespace
    }

    fn insert_predefined(&mut self, name: NameSeg, typ: ObjectType, object: Option<Object>) {
        let handle = self.allocate_handle();
        let mut node = NamespaceNode::new(name, typ, Some(NodeHandle::ROOT), OwnerId::ROOT);
        node.object = object.map(ObjectRef::new);
        self.nodes.insert(handle, node);
        if let Some(root) = self.nodes.get_mut(&NodeHandle::ROOT) {
            root.children.insert(name, handle);
        }
        self.owners.entry(OwnerId::ROOT).or_default().insert(handle);
    }

    fn allocate_handle(&mut self) -> NodeHandle {
        let handle = NodeHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    pub fn root(&self) -> NodeHandle {
        NodeHandle::ROOT
    }

    /// Create a new node called `name` under `parent`. Fails with `NameCollision` if `parent` already has a
    /// child of that name.
    pub fn add_node(
        &mut self,
        parent: NodeHandle,
        name: NameSeg,
        typ: ObjectType,
        owner_id: OwnerId,
    ) -> Result<NodeHandle, AmlError> {
        let parent_node = self.get(parent)?;
        if parent_node.children.contains_key(&name) {
            let mut path = self.path_of(parent)?;
            path.push(name);
            return Err(AmlError::NameCollision(path));
        }

        let handle = self.allocate_handle();
        trace!("Adding node {:?} ({:?}) under {:?}, owner {:?}", name, typ, parent, owner_id);
        self.nodes.insert(handle, NamespaceNode::new(name, typ, Some(parent), owner_id));
        self.get_mut(parent)?.children.insert(name, handle);
        self.owners.entry(owner_id).or_default().insert(handle);
        Ok(handle)
    }

    pub fn get(&self, handle: NodeHandle) -> Result<&NamespaceNode, AmlError> {
        self.nodes.get(&handle).ok_or(AmlError::BadParameter)
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Result<&mut NamespaceNode, AmlError> {
        self.nodes.get_mut(&handle).ok_or(AmlError::BadParameter)
    }

    pub fn child(&self, parent: NodeHandle, name: NameSeg) -> Option<NodeHandle> {
        self.nodes.get(&parent).and_then(|node| node.children.get(&name).copied())
    }

    /// Attach an object to a node, updating the node's type to match it.
    pub fn attach_object(&mut self, handle: NodeHandle, object: ObjectRef) -> Result<(), AmlError> {
        let typ = object.typ();
        let node = self.get_mut(handle)?;
        node.typ = typ;
        node.object = Some(object);
        Ok(())
    }

    /// Find the node `path` refers to from `scope`, applying the search rules of §5.3 of the ACPI
    /// specification: a relative name of a single segment is looked for in `scope` and then in each enclosing
    /// scope up to the root.
    pub fn search(&self, path: &AmlName, scope: NodeHandle) -> Result<NodeHandle, AmlError> {
        if let Some(seg) = path.search_segment() {
            let mut scope = Some(scope);
            while let Some(level) = scope {
                let node = self.get(level)?;
                if let Some(&handle) = node.children.get(&seg) {
                    return Ok(handle);
                }
                scope = node.parent;
            }
            Err(AmlError::NotFound(path.clone()))
        } else {
            self.walk_components(scope, &path.0).ok_or_else(|| AmlError::NotFound(path.clone()))
        }
    }

    /// Get the node that a declaration of `path` from `scope` should be created under, and the name of the new
    /// node. Search rules never apply to declarations.
    pub fn resolve_declaration(&self, path: &AmlName, scope: NodeHandle) -> Result<(NodeHandle, NameSeg), AmlError> {
        match path.0.split_last() {
            Some((NameComponent::Segment(seg), prefix)) => {
                let parent = self.walk_components(scope, prefix).ok_or_else(|| AmlError::NotFound(path.clone()))?;
                Ok((parent, *seg))
            }
            _ => Err(AmlError::InvalidName(Some(path.clone()))),
        }
    }

    fn walk_components(&self, scope: NodeHandle, components: &[NameComponent]) -> Option<NodeHandle> {
        let mut current = scope;
        for component in components {
            current = match component {
                NameComponent::Root => NodeHandle::ROOT,
                NameComponent::Prefix => self.nodes.get(&current)?.parent?,
                NameComponent::Segment(seg) => *self.nodes.get(&current)?.children.get(seg)?,
            };
        }
        Some(current)
    }

    /// Reconstruct the absolute path of a node.
    pub fn path_of(&self, handle: NodeHandle) -> Result<AmlName, AmlError> {
        let mut segments = Vec::new();
        let mut current = self.get(handle)?;
        while let Some(parent) = current.parent {
            segments.push(NameComponent::Segment(current.name));
            current = self.get(parent)?;
        }
        segments.push(NameComponent::Root);
        segments.reverse();
        Ok(AmlName(segments))
    }

    /// Remove every node created by `owner_id`, along with any descendants of those nodes. Returns the objects
    /// that were attached to the removed nodes, so the caller can release them.
    pub fn delete_owner(&mut self, owner_id: OwnerId) -> Vec<ObjectRef> {
        let mut detached = Vec::new();
        let owned = match self.owners.remove(&owner_id) {
            Some(owned) => owned,
            None => return detached,
        };
        trace!("Deleting {} nodes owned by {:?}", owned.len(), owner_id);

        for handle in owned {
            if handle == NodeHandle::ROOT || !self.nodes.contains_key(&handle) {
                continue;
            }

            if let Some(parent) = self.nodes.get(&handle).and_then(|node| node.parent) {
                let name = self.nodes.get(&handle).map(|node| node.name);
                if let (Some(parent), Some(name)) = (self.nodes.get_mut(&parent), name) {
                    parent.children.remove(&name);
                }
            }

            /*
             * Remove the subtree iteratively, children before their parents. Descendants may belong to another
             * owner (a later table can add objects to a scope created by this one), so they are also removed
             * from that owner's index.
             */
            let mut stack = vec![(handle, false)];
            while let Some((current, expanded)) = stack.pop() {
                if !expanded {
                    stack.push((current, true));
                    if let Some(node) = self.nodes.get(&current) {
                        stack.extend(node.children.values().map(|&child| (child, false)));
                    }
                    continue;
                }

                if let Some(node) = self.nodes.remove(&current) {
                    if node.owner_id != owner_id {
                        if let Some(other) = self.owners.get_mut(&node.owner_id) {
                            other.remove(&current);
                        }
                    }
                    detached.extend(node.object);
                }
            }
        }

        detached
    }

    pub fn nodes_owned_by(&self, owner_id: OwnerId) -> Vec<NodeHandle> {
        self.owners.get(&owner_id).map(|owned| owned.iter().copied().collect()).unwrap_or_default()
    }

    pub fn owner_node_count(&self, owner_id: OwnerId) -> usize {
        self.owners.get(&owner_id).map_or(0, |owned| owned.len())
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::new()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const INDENT_PER_LEVEL: usize = 4;

        writeln!(f, "\\:")?;
        let mut stack: Vec<(NodeHandle, usize)> = Vec::new();
        if let Some(root) = self.nodes.get(&NodeHandle::ROOT) {
            stack.extend(root.children.values().rev().map(|&child| (child, 1)));
        }

        while let Some((handle, depth)) = stack.pop() {
            let Some(node) = self.nodes.get(&handle) else { continue };
            write!(f, "{:indent$}{}: {:?}", "", node.name.as_str(), node.typ, indent = depth * INDENT_PER_LEVEL)?;
            if let Some(ref object) = node.object {
                write!(f, " = {:?}", object)?;
            }
            writeln!(f)?;
            stack.extend(node.children.values().rev().map(|&child| (child, depth + 1)));
        }

        Ok(())
    }
}

/// The predefined `\_OSI` method. We answer for the interfaces an up-to-date Windows reports, which is what firmware
/// tends to test against.
fn osi(args: &[ObjectRef]) -> Result<ObjectRef, AmlError> {
    const INTERFACES: &[&str] = &[
        "Windows 2000",
        "Windows 2001",
        "Windows 2001 SP1",
        "Windows 2001 SP2",
        "Windows 2001.1",
        "Windows 2006",
        "Windows 2009",
        "Windows 2012",
        "Windows 2013",
        "Windows 2015",
        "Module Device",
        "Processor Device",
        "3.0 Thermal Model",
        "Extended Address Space Descriptor",
    ];

    let interface = match args.first().map(|arg| arg.lock().clone()) {
        Some(Object::String(interface)) => interface,
        Some(other) => {
            return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::String, got: other.typ() })
        }
        None => return Err(AmlError::MethodArgCountIncorrect),
    };

    let supported = INTERFACES.contains(&interface.as_str());
    trace!("_OSI({:?}) -> {}", interface, supported);
    Ok(ObjectRef::new(Object::Integer(if supported { u64::MAX } else { 0 })))
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct AmlName(Vec<NameComponent>);

impl AmlName {
    pub fn root() -> AmlName {
        AmlName(vec![NameComponent::Root])
    }

    /// The empty name, as produced by a `NullName`.
    pub fn null() -> AmlName {
        AmlName(Vec::new())
    }

    pub fn from_name_seg(seg: NameSeg) -> AmlName {
        AmlName(vec![NameComponent::Segment(seg)])
    }

    pub fn from_components(components: Vec<NameComponent>) -> AmlName {
        AmlName(components)
    }

    pub fn components(&self) -> &[NameComponent] {
        &self.0
    }

    pub fn push(&mut self, seg: NameSeg) {
        self.0.push(NameComponent::Segment(seg));
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_string(&self) -> String {
        self.0
            .iter()
            .fold(String::new(), |name, component| match component {
                NameComponent::Root => name + "\\",
                NameComponent::Prefix => name + "^",
                NameComponent::Segment(seg) => name + seg.as_str() + ".",
            })
            .trim_end_matches('.')
            .to_string()
    }

    /// A path is normal if it contains no parent prefixes (`^` characters, when written out).
    pub fn is_normal(&self) -> bool {
        !self.0.contains(&NameComponent::Prefix)
    }

    pub fn is_absolute(&self) -> bool {
        self.0.first() == Some(&NameComponent::Root)
    }

    /// Search rules only apply to relative names made of a single segment.
    pub fn search_rules_apply(&self) -> bool {
        self.search_segment().is_some()
    }

    fn search_segment(&self) -> Option<NameSeg> {
        match self.0.as_slice() {
            [NameComponent::Segment(seg)] => Some(*seg),
            _ => None,
        }
    }

    /// Resolve the parent prefixes of this path. Returns `InvalidNormalizedName` if a prefix would move above the
    /// start of the path (e.g. `\^_FOO`).
    pub fn normalize(self) -> Result<AmlName, AmlError> {
        if self.is_normal() {
            return Ok(self);
        }

        let mut normalized = Vec::with_capacity(self.0.len());
        for component in &self.0 {
            match component {
                NameComponent::Prefix => match normalized.last() {
                    Some(NameComponent::Segment(_)) => {
                        normalized.pop();
                    }
                    _ => return Err(AmlError::InvalidNormalizedName(self.clone())),
                },
                other => normalized.push(*other),
            }
        }

        Ok(AmlName(normalized))
    }

    /// Get the parent of this path. For example, the parent of `\_SB.PCI0._PRT` is `\_SB.PCI0`.
    pub fn parent(&self) -> Result<AmlName, AmlError> {
        let mut normalized = self.clone().normalize()?;
        match normalized.0.last() {
            Some(NameComponent::Segment(_)) => {
                normalized.0.pop();
                Ok(normalized)
            }
            _ => Err(AmlError::RootHasNoParent),
        }
    }

    /// Resolve this path against an absolute scope, producing a normalized absolute path.
    pub fn resolve(&self, scope: &AmlName) -> Result<AmlName, AmlError> {
        if self.is_absolute() {
            return self.clone().normalize();
        }
        if !scope.is_absolute() {
            return Err(AmlError::InvalidName(Some(scope.clone())));
        }

        let mut resolved = scope.clone();
        resolved.0.extend_from_slice(&self.0);
        resolved.normalize()
    }
}

impl FromStr for AmlName {
    type Err = AmlError;

    fn from_str(mut string: &str) -> Result<AmlName, AmlError> {
        if string.is_empty() {
            return Err(AmlError::EmptyNamesAreInvalid);
        }

        let mut components = Vec::new();
        if let Some(rest) = string.strip_prefix('\\') {
            components.push(NameComponent::Root);
            string = rest;
        }

        if !string.is_empty() {
            for mut part in string.split('.') {
                while let Some(rest) = part.strip_prefix('^') {
                    components.push(NameComponent::Prefix);
                    part = rest;
                }
                components.push(NameComponent::Segment(NameSeg::from_str(part)?));
            }
        }

        Ok(AmlName(components))
    }
}

impl fmt::Display for AmlName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum NameComponent {
    Root,
    Prefix,
    Segment(NameSeg),
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameSeg(pub(crate) [u8; 4]);

impl NameSeg {
    /// The name given to the root node. It is never matched by a lookup.
    pub const ROOT: NameSeg = NameSeg(*b"\\___");

    pub fn from_bytes(bytes: [u8; 4]) -> Result<NameSeg, AmlError> {
        if !is_lead_name_char(bytes[0]) || !bytes[1..].iter().all(|&b| is_name_char(b)) {
            return Err(AmlError::InvalidNameSeg);
        }
        Ok(NameSeg(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Every constructor checks that the bytes are ASCII
        str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl FromStr for NameSeg {
    type Err = AmlError;

    /// Parse a segment of one to four characters. Short segments are padded with `_`.
    fn from_str(string: &str) -> Result<NameSeg, AmlError> {
        let bytes = string.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 {
            return Err(AmlError::InvalidNameSeg);
        }

        let mut seg = [b'_'; 4];
        seg[..bytes.len()].copy_from_slice(bytes);
        NameSeg::from_bytes(seg)
    }
}

// A list of ASCII codes is pretty much never useful, so we always just show it as a string
impl fmt::Debug for NameSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

pub fn is_lead_name_char(c: u8) -> bool {
    c.is_ascii_uppercase() || c == b'_'
}

pub fn is_name_char(c: u8) -> bool {
    is_lead_name_char(c) || c.is_ascii_digit()
}
