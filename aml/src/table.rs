use crate::AmlError;
use alloc::{sync::Arc, vec::Vec};
use bitvec::{bitvec, vec::BitVec};
use byteorder::{ByteOrder, LittleEndian};
use core::{fmt, str};
use log::{trace, warn};

pub const SDT_HEADER_LENGTH: usize = 36;

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub const DSDT: Signature = Signature(*b"DSDT");
    pub const SSDT: Signature = Signature(*b"SSDT");
    pub const PSDT: Signature = Signature(*b"PSDT");

    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Whether tables with this signature contain AML.
    pub fn is_aml_table(&self) -> bool {
        matches!(*self, Signature::DSDT | Signature::SSDT | Signature::PSDT)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.as_str())
    }
}

/// The header shared by all system description tables. The AML of a table follows its header directly and runs
/// to `length` bytes from the start of the table.
#[derive(Clone, Copy, Debug)]
pub struct SdtHeader {
    pub signature: Signature,
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

impl SdtHeader {
    pub fn parse(bytes: &[u8]) -> Result<SdtHeader, AmlError> {
        if bytes.len() < SDT_HEADER_LENGTH {
            return Err(AmlError::BadHeader);
        }

        let mut oem_id = [0; 6];
        oem_id.copy_from_slice(&bytes[10..16]);
        let mut oem_table_id = [0; 8];
        oem_table_id.copy_from_slice(&bytes[16..24]);

        let header = SdtHeader {
            signature: Signature([bytes[0], bytes[1], bytes[2], bytes[3]]),
            length: LittleEndian::read_u32(&bytes[4..8]),
            revision: bytes[8],
            checksum: bytes[9],
            oem_id,
            oem_table_id,
            oem_revision: LittleEndian::read_u32(&bytes[24..28]),
            creator_id: LittleEndian::read_u32(&bytes[28..32]),
            creator_revision: LittleEndian::read_u32(&bytes[32..36]),
        };

        if (header.length as usize) < SDT_HEADER_LENGTH || header.length as usize > bytes.len() {
            return Err(AmlError::BadHeader);
        }
        Ok(header)
    }

    /// Check the signature is of a table we can load, and that the table's checksum is correct. Firmware with
    /// bad checksums is common enough that a mismatch is only reported.
    pub fn validate(&self, table: &[u8]) -> Result<(), AmlError> {
        if !self.signature.is_aml_table() {
            return Err(AmlError::BadHeader);
        }

        let sum = table[..self.length as usize].iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte));
        if sum != 0 {
            warn!("Table {} has an invalid checksum (sums to {:#x}). Continuing anyway.", self.signature, sum);
        }

        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TableIndex(pub u32);

/// Identifies the table load (or method invocation) that created a set of namespace nodes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct OwnerId(pub u16);

impl OwnerId {
    /// Owns the predefined namespace objects. Never allocated or released.
    pub const ROOT: OwnerId = OwnerId(0);
}

pub struct TableDesc {
    pub header: SdtHeader,
    /// The AML of the table, without its header.
    pub aml: Arc<[u8]>,
    pub owner_id: Option<OwnerId>,
}

/// Allocation map of owner ids. Allocation rotates through the space, so a recently-released id is not handed
/// straight back out.
pub struct OwnerIdSpace {
    map: BitVec,
    next: usize,
}

impl OwnerIdSpace {
    pub const SIZE: usize = 256;

    pub fn new() -> OwnerIdSpace {
        let mut map = bitvec![0; Self::SIZE];
        map.set(OwnerId::ROOT.0 as usize, true);
        OwnerIdSpace { map, next: 1 }
    }

    pub fn allocate(&mut self) -> Result<OwnerId, AmlError> {
        let id = self.map[self.next..]
            .first_zero()
            .map(|offset| offset + self.next)
            .or_else(|| self.map.first_zero())
            .ok_or(AmlError::OwnerIdExhausted)?;

        self.map.set(id, true);
        self.next = if id + 1 >= Self::SIZE { 1 } else { id + 1 };
        Ok(OwnerId(id as u16))
    }

    pub fn release(&mut self, id: OwnerId) {
        if id != OwnerId::ROOT && (id.0 as usize) < Self::SIZE {
            self.map.set(id.0 as usize, false);
        }
    }

    pub fn is_allocated(&self, id: OwnerId) -> bool {
        self.map.get(id.0 as usize).map_or(false, |bit| *bit)
    }
}

impl Default for OwnerIdSpace {
    fn default() -> Self {
        OwnerIdSpace::new()
    }
}

/// Every table installed into the interpreter, with the owner ids and loaded flags that track each one.
pub struct TableList {
    tables: Vec<TableDesc>,
    owner_ids: OwnerIdSpace,
    loaded: BitVec,
}

impl TableList {
    pub fn new() -> TableList {
        TableList { tables: Vec::new(), owner_ids: OwnerIdSpace::new(), loaded: BitVec::new() }
    }

    /// Validate a table and add it to the list. The table is not loaded.
    pub fn install(&mut self, table: &[u8]) -> Result<TableIndex, AmlError> {
        let header = SdtHeader::parse(table)?;
        header.validate(table)?;

        let index = TableIndex(self.tables.len() as u32);
        trace!("Installing table {} ({} bytes) at {:?}", header.signature, header.length, index);
        self.tables.push(TableDesc {
            header,
            aml: Arc::from(&table[SDT_HEADER_LENGTH..header.length as usize]),
            owner_id: None,
        });
        self.loaded.push(false);
        Ok(index)
    }

    pub fn get_table(&self, index: TableIndex) -> Result<&TableDesc, AmlError> {
        self.tables.get(index.0 as usize).ok_or(AmlError::InvalidTableIndex)
    }

    fn get_table_mut(&mut self, index: TableIndex) -> Result<&mut TableDesc, AmlError> {
        self.tables.get_mut(index.0 as usize).ok_or(AmlError::InvalidTableIndex)
    }

    pub fn allocate_owner_id(&mut self, index: TableIndex) -> Result<OwnerId, AmlError> {
        if self.get_table(index)?.owner_id.is_some() {
            return Err(AmlError::AlreadyExists);
        }

        let id = self.owner_ids.allocate()?;
        self.get_table_mut(index)?.owner_id = Some(id);
        Ok(id)
    }

    pub fn release_owner_id(&mut self, index: TableIndex) -> Result<(), AmlError> {
        if let Some(id) = self.get_table_mut(index)?.owner_id.take() {
            self.owner_ids.release(id);
        }
        Ok(())
    }

    pub fn get_owner_id(&self, index: TableIndex) -> Result<OwnerId, AmlError> {
        self.get_table(index)?.owner_id.ok_or(AmlError::BadParameter)
    }

    /// Allocate an owner id not associated with any table, for the objects a method creates while it runs.
    pub fn allocate_transient_owner(&mut self) -> Result<OwnerId, AmlError> {
        self.owner_ids.allocate()
    }

    pub fn release_transient_owner(&mut self, id: OwnerId) {
        self.owner_ids.release(id);
    }

    pub fn is_loaded(&self, index: TableIndex) -> bool {
        self.loaded.get(index.0 as usize).map_or(false, |bit| *bit)
    }

    pub fn set_loaded(&mut self, index: TableIndex, loaded: bool) -> Result<(), AmlError> {
        let i = index.0 as usize;
        if i >= self.loaded.len() {
            return Err(AmlError::InvalidTableIndex);
        }
        self.loaded.set(i, loaded);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Default for TableList {
    fn default() -> Self {
        TableList::new()
    }
}
