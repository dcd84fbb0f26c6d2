use crate::{
    namespace::{NameSeg, NodeHandle},
    object::{
        align_down,
        copy_bits,
        zeroed_bytes,
        Deferred,
        FieldUnit,
        FieldUnitKind,
        FieldUpdateRule,
        Object,
        ObjectRef,
        ObjectType,
    },
    AmlError,
    Interpreter,
};
use alloc::vec::Vec;
use bit_field::BitField;
use core::str::FromStr;
use log::trace;

#[derive(Clone, Debug)]
pub struct OpRegion {
    pub space: RegionSpace,
    pub base: u64,
    pub length: u64,
    /// The device the region was declared in. PCI configuration regions find their address through it.
    pub parent_device: NodeHandle,
    /// Set if the region's address and length have not been evaluated yet.
    pub deferred: Option<Deferred>,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum RegionSpace {
    SystemMemory,
    SystemIO,
    PciConfig,
    EmbeddedControl,
    SmBus,
    SystemCmos,
    PciBarTarget,
    Ipmi,
    GeneralPurposeIo,
    GenericSerialBus,
    Pcc,
    Oem(u8),
}

impl From<u8> for RegionSpace {
    fn from(value: u8) -> Self {
        match value {
            0 => RegionSpace::SystemMemory,
            1 => RegionSpace::SystemIO,
            2 => RegionSpace::PciConfig,
            3 => RegionSpace::EmbeddedControl,
            4 => RegionSpace::SmBus,
            5 => RegionSpace::SystemCmos,
            6 => RegionSpace::PciBarTarget,
            7 => RegionSpace::Ipmi,
            8 => RegionSpace::GeneralPurposeIo,
            9 => RegionSpace::GenericSerialBus,
            10 => RegionSpace::Pcc,
            _ => RegionSpace::Oem(value),
        }
    }
}

/// Reads of up to 64 bits produce integers; anything longer is a buffer.
fn field_value(bytes: Vec<u8>, bit_length: usize) -> ObjectRef {
    if bit_length <= 64 {
        let mut value = [0u8; 8];
        let length = bytes.len().min(8);
        value[..length].copy_from_slice(&bytes[..length]);
        ObjectRef::new(Object::Integer(u64::from_le_bytes(value)))
    } else {
        ObjectRef::new(Object::Buffer { data: bytes, deferred: None })
    }
}

fn bytes_for_bits(bits: usize) -> usize {
    bits / 8 + usize::from(bits % 8 != 0)
}

fn value_bytes(value: &ObjectRef) -> Result<Vec<u8>, AmlError> {
    match *value.lock() {
        Object::Integer(value) => Ok(value.to_le_bytes().to_vec()),
        Object::Buffer { ref data, deferred: None } => Ok(data.clone()),
        Object::String(ref string) => Ok(string.as_bytes().to_vec()),
        ref other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Integer, got: other.typ() }),
    }
}

impl Interpreter {
    /// Read the current value of a buffer field or field unit. Every read produces a new object.
    pub fn read_field(&self, field: &ObjectRef) -> Result<ObjectRef, AmlError> {
        let object = field.lock().clone();
        match object {
            Object::BufferField { buffer, bit_index, bit_length } => {
                if !buffer.is_realized() {
                    self.realize(&buffer)?;
                }
                let mut bytes = zeroed_bytes(bytes_for_bits(bit_length))?;
                match *buffer.lock() {
                    Object::Buffer { ref data, .. } => copy_bits(data, bit_index, &mut bytes, 0, bit_length),
                    ref other => {
                        return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: other.typ() })
                    }
                }
                Ok(field_value(bytes, bit_length))
            }
            Object::FieldUnit(unit) => {
                let mut bytes = zeroed_bytes(bytes_for_bits(unit.bit_length))?;
                self.read_field_unit(&unit, &mut bytes)?;
                Ok(field_value(bytes, unit.bit_length))
            }
            other => Err(AmlError::OperandTypeError { declared: ObjectType::RegionField, actual: other.typ() }),
        }
    }

    /// Write `value` to a buffer field or field unit. Values shorter than the field are zero-extended, and longer
    /// ones are truncated.
    pub fn write_field(&self, field: &ObjectRef, value: ObjectRef) -> Result<(), AmlError> {
        let bytes = value_bytes(&value)?;
        let object = field.lock().clone();
        match object {
            Object::BufferField { buffer, bit_index, bit_length } => {
                if !buffer.is_realized() {
                    self.realize(&buffer)?;
                }
                match *buffer.lock() {
                    Object::Buffer { ref mut data, .. } => copy_bits(&bytes, 0, data, bit_index, bit_length),
                    ref other => {
                        return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: other.typ() })
                    }
                }
                Ok(())
            }
            Object::FieldUnit(unit) => self.write_field_unit(&unit, &bytes),
            other => Err(AmlError::OperandTypeError { declared: ObjectType::RegionField, actual: other.typ() }),
        }
    }

    /*
     * Field units are accessed a whole access-width at a time, starting from the access boundary at or below the
     * start of the field. Each access contributes the bits that overlap the field.
     */
    fn read_field_unit(&self, unit: &FieldUnit, out: &mut [u8]) -> Result<(), AmlError> {
        let width = unit.flags.access_type()?.width();
        let end = unit.bit_index + unit.bit_length;
        let mut bit = align_down(unit.bit_index, width);

        while bit < end {
            let raw = self.access_field_unit(unit, bit / 8, width, None)?.to_le_bytes();
            let low = bit.max(unit.bit_index);
            let high = (bit + width).min(end);
            copy_bits(&raw, low - bit, out, low - unit.bit_index, high - low);
            bit += width;
        }
        Ok(())
    }

    fn write_field_unit(&self, unit: &FieldUnit, value: &[u8]) -> Result<(), AmlError> {
        let width = unit.flags.access_type()?.width();
        let update_rule = unit.flags.update_rule()?;
        let end = unit.bit_index + unit.bit_length;
        let mut bit = align_down(unit.bit_index, width);

        while bit < end {
            let low = bit.max(unit.bit_index);
            let high = (bit + width).min(end);
            let covers_access = low == bit && high == bit + width;

            let initial = match update_rule {
                FieldUpdateRule::Preserve if !covers_access => self.access_field_unit(unit, bit / 8, width, None)?,
                FieldUpdateRule::Preserve | FieldUpdateRule::WriteAsZeros => 0,
                FieldUpdateRule::WriteAsOnes => u64::MAX,
            };

            let mut raw = initial.to_le_bytes();
            copy_bits(value, low - unit.bit_index, &mut raw, low - bit, high - low);
            let mut raw = u64::from_le_bytes(raw);
            if width < 64 {
                raw.set_bits(width..64, 0);
            }

            self.access_field_unit(unit, bit / 8, width, Some(raw))?;
            bit += width;
        }
        Ok(())
    }

    /// Make a single access of `width` bits, at `offset` bytes into the space of the field unit. Writes if
    /// `value` is given, and reads otherwise.
    fn access_field_unit(
        &self,
        unit: &FieldUnit,
        offset: usize,
        width: usize,
        value: Option<u64>,
    ) -> Result<u64, AmlError> {
        let region = match unit.kind {
            FieldUnitKind::Normal { region } => region,
            FieldUnitKind::Bank { region, bank, bank_value } => {
                let bank = self.node_object(bank)?;
                self.write_field(&bank, ObjectRef::new(Object::Integer(bank_value)))?;
                region
            }
            FieldUnitKind::Index { index, data } => {
                let index = self.node_object(index)?;
                let data = self.node_object(data)?;
                self.write_field(&index, ObjectRef::new(Object::Integer(offset as u64)))?;
                return match value {
                    Some(value) => self.write_field(&data, ObjectRef::new(Object::Integer(value))).map(|_| 0),
                    None => self.read_field(&data)?.to_integer(),
                };
            }
        };

        let region = match *self.node_object(region)?.lock() {
            Object::Region(ref region) => region.clone(),
            ref other => {
                return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Region, got: other.typ() })
            }
        };
        if region.deferred.is_some() {
            return Err(AmlError::UninitializedNode);
        }

        match value {
            Some(value) => self.write_region(&region, offset as u64, width, value).map(|_| 0),
            None => self.read_region(&region, offset as u64, width),
        }
    }

    /// Perform a standard-size read from a region. `width` is in bits, and `offset` in bytes from the base of
    /// the region.
    pub fn read_region(&self, region: &OpRegion, offset: u64, width: usize) -> Result<u64, AmlError> {
        let address = region.base + offset;
        trace!("Reading {} bits at {:#x} in {:?}", width, address, region.space);

        match region.space {
            RegionSpace::SystemMemory => {
                let address = address as usize;
                match width {
                    8 => Ok(self.handler.read_u8(address) as u64),
                    16 => Ok(self.handler.read_u16(address) as u64),
                    32 => Ok(self.handler.read_u32(address) as u64),
                    64 => Ok(self.handler.read_u64(address)),
                    _ => Err(AmlError::InvalidFieldFlags),
                }
            }

            RegionSpace::SystemIO => {
                let port = address as u16;
                match width {
                    8 => Ok(self.handler.read_io_u8(port) as u64),
                    16 => Ok(self.handler.read_io_u16(port) as u64),
                    32 => Ok(self.handler.read_io_u32(port) as u64),
                    _ => Err(AmlError::InvalidFieldFlags),
                }
            }

            RegionSpace::PciConfig => {
                let (segment, bus, device, function) = self.pci_address(region.parent_device)?;
                let offset = address as u16;
                match width {
                    8 => Ok(self.handler.read_pci_u8(segment, bus, device, function, offset) as u64),
                    16 => Ok(self.handler.read_pci_u16(segment, bus, device, function, offset) as u64),
                    32 => Ok(self.handler.read_pci_u32(segment, bus, device, function, offset) as u64),
                    _ => Err(AmlError::InvalidFieldFlags),
                }
            }

            _ => Err(AmlError::UnsupportedRegionSpace),
        }
    }

    pub fn write_region(&self, region: &OpRegion, offset: u64, width: usize, value: u64) -> Result<(), AmlError> {
        let address = region.base + offset;
        trace!("Writing {:#x} ({} bits) at {:#x} in {:?}", value, width, address, region.space);

        match region.space {
            RegionSpace::SystemMemory => {
                let address = address as usize;
                match width {
                    8 => self.handler.write_u8(address, value as u8),
                    16 => self.handler.write_u16(address, value as u16),
                    32 => self.handler.write_u32(address, value as u32),
                    64 => self.handler.write_u64(address, value),
                    _ => return Err(AmlError::InvalidFieldFlags),
                }
            }

            RegionSpace::SystemIO => {
                let port = address as u16;
                match width {
                    8 => self.handler.write_io_u8(port, value as u8),
                    16 => self.handler.write_io_u16(port, value as u16),
                    32 => self.handler.write_io_u32(port, value as u32),
                    _ => return Err(AmlError::InvalidFieldFlags),
                }
            }

            RegionSpace::PciConfig => {
                let (segment, bus, device, function) = self.pci_address(region.parent_device)?;
                let offset = address as u16;
                match width {
                    8 => self.handler.write_pci_u8(segment, bus, device, function, offset, value as u8),
                    16 => self.handler.write_pci_u16(segment, bus, device, function, offset, value as u16),
                    32 => self.handler.write_pci_u32(segment, bus, device, function, offset, value as u32),
                    _ => return Err(AmlError::InvalidFieldFlags),
                }
            }

            _ => return Err(AmlError::UnsupportedRegionSpace),
        }
        Ok(())
    }

    /// Find the PCI address of a device. The device and function come from `_ADR`, which must exist. `_SEG` and
    /// `_BBN` are optional, with defaults that line up with legacy PCI implementations (a single segment group
    /// and a single root bus).
    fn pci_address(&self, device: NodeHandle) -> Result<(u16, u8, u8, u8), AmlError> {
        let adr = self.evaluate_child(device, "_ADR")?.ok_or(AmlError::UninitializedNode)?;
        let segment = self.evaluate_child(device, "_SEG")?.unwrap_or(0);
        let bus = self.evaluate_child(device, "_BBN")?.unwrap_or(0);

        Ok((segment as u16, bus as u8, adr.get_bits(16..24) as u8, adr.get_bits(0..8) as u8))
    }

    fn evaluate_child(&self, device: NodeHandle, name: &str) -> Result<Option<u64>, AmlError> {
        let seg = NameSeg::from_str(name)?;
        let child = self.namespace.lock().child(device, seg);
        match child {
            Some(child) => Ok(Some(self.evaluate_node(child, Vec::new(), 0)?.to_integer()?)),
            None => Ok(None),
        }
    }
}
