//! # Register Store
//!
//! Each slave owns a set of named blocks. A block belongs to one of the four
//! Modbus tables, starts at a protocol address and holds a contiguous run of
//! 16-bit cells. Applications address blocks by name and a 0-based offset;
//! the slave engine addresses them by table and protocol address.
//!
//! | Kind | Table | Read | Write |
//! |------|-------|------|-------|
//! | `Coils` | 0x | FC01 | FC05, FC0F |
//! | `DiscreteInputs` | 1x | FC02 | - |
//! | `InputRegisters` | 3x | FC04 | - |
//! | `HoldingRegisters` | 4x | FC03 | FC06, FC10 |
//!
//! Bit tables store `1` for ON and `0` for OFF. On the wire a single coil
//! write carries `0xFF00`/`0x0000`; see [`coil_to_wire`] and
//! [`coil_from_wire`].

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::constants::{COIL_OFF, COIL_ON};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, SlaveId};

/// Modbus data table a block lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl BlockKind {
    /// Single-bit tables
    pub fn is_bit(self) -> bool {
        matches!(self, BlockKind::Coils | BlockKind::DiscreteInputs)
    }

    /// Tables a master may write
    pub fn is_writable(self) -> bool {
        matches!(self, BlockKind::Coils | BlockKind::HoldingRegisters)
    }

    /// Table addressed by a function code
    pub fn for_function(function: ModbusFunction) -> Self {
        match function {
            ModbusFunction::ReadCoils
            | ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteMultipleCoils => BlockKind::Coils,
            ModbusFunction::ReadDiscreteInputs => BlockKind::DiscreteInputs,
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleRegisters => BlockKind::HoldingRegisters,
            ModbusFunction::ReadInputRegisters => BlockKind::InputRegisters,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockKind::Coils => "coils",
            BlockKind::DiscreteInputs => "discrete inputs",
            BlockKind::HoldingRegisters => "holding registers",
            BlockKind::InputRegisters => "input registers",
        };
        f.write_str(s)
    }
}

/// Wire value of a coil state
#[inline]
pub fn coil_to_wire(on: bool) -> u16 {
    if on {
        COIL_ON
    } else {
        COIL_OFF
    }
}

/// Coil state from a wire value; anything but `0xFF00`/`0x0000` is rejected
pub fn coil_from_wire(value: u16) -> ModbusResult<bool> {
    match value {
        COIL_ON => Ok(true),
        COIL_OFF => Ok(false),
        other => Err(ModbusError::invalid_data(format!(
            "Coil value 0x{:04X} must be 0xFF00 or 0x0000",
            other
        ))),
    }
}

/// Named contiguous run of cells
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    name: String,
    kind: BlockKind,
    start_address: u16,
    values: Vec<u16>,
}

impl RegisterBlock {
    fn new(name: String, kind: BlockKind, start_address: u16, length: usize) -> Self {
        Self {
            name,
            kind,
            start_address,
            values: vec![0; length],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn start_address(&self) -> u16 {
        self.start_address
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// One past the last protocol address
    fn end(&self) -> u32 {
        self.start_address as u32 + self.values.len() as u32
    }

    fn covers(&self, address: u16, count: usize) -> bool {
        address >= self.start_address && address as u32 + count as u32 <= self.end()
    }

    fn overlaps(&self, start: u16, length: usize) -> bool {
        (start as u32) < self.end() && self.start_address as u32 <= start as u32 + length as u32 - 1
    }

    fn check_range(&self, offset: usize, count: usize) -> ModbusResult<()> {
        match offset.checked_add(count) {
            Some(end) if end <= self.values.len() => Ok(()),
            _ => Err(ModbusError::OutOfRange {
                block: self.name.clone(),
                offset,
                count,
                length: self.values.len(),
            }),
        }
    }

    pub fn get(&self, offset: usize, count: usize) -> ModbusResult<&[u16]> {
        self.check_range(offset, count)?;
        Ok(&self.values[offset..offset + count])
    }

    pub fn set(&mut self, offset: usize, values: &[u16]) -> ModbusResult<()> {
        self.check_range(offset, values.len())?;
        let cells = &mut self.values[offset..offset + values.len()];
        if self.kind.is_bit() {
            for (cell, &v) in cells.iter_mut().zip(values) {
                *cell = u16::from(v != 0);
            }
        } else {
            cells.copy_from_slice(values);
        }
        Ok(())
    }
}

/// Blocks of one slave address
#[derive(Debug, Clone)]
pub struct SlaveStore {
    slave_id: SlaveId,
    blocks: Vec<RegisterBlock>,
}

impl SlaveStore {
    pub fn new(slave_id: SlaveId) -> Self {
        Self {
            slave_id,
            blocks: Vec::new(),
        }
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    /// Register a new block of `length` zeroed cells.
    ///
    /// Fails with `DuplicateBlock` when the name is taken and with
    /// `OverlappingBlock` when the range collides with a block of the same
    /// kind.
    pub fn add_block(
        &mut self,
        name: &str,
        kind: BlockKind,
        start_address: u16,
        length: usize,
    ) -> ModbusResult<()> {
        if self.blocks.iter().any(|b| b.name == name) {
            return Err(ModbusError::DuplicateBlock {
                name: name.to_string(),
            });
        }
        if length == 0 {
            return Err(ModbusError::invalid_data(format!(
                "Block '{}' must hold at least one cell",
                name
            )));
        }
        if start_address as usize + length > 0x1_0000 {
            return Err(ModbusError::invalid_data(format!(
                "Block '{}' at {} with {} cells runs past address 65535",
                name, start_address, length
            )));
        }
        if let Some(existing) = self
            .blocks
            .iter()
            .find(|b| b.kind == kind && b.overlaps(start_address, length))
        {
            return Err(ModbusError::OverlappingBlock {
                name: name.to_string(),
                existing: existing.name.clone(),
            });
        }

        debug!(
            "slave {}: added {} block '{}' at {} x{}",
            self.slave_id, kind, name, start_address, length
        );
        self.blocks
            .push(RegisterBlock::new(name.to_string(), kind, start_address, length));
        Ok(())
    }

    pub fn remove_block(&mut self, name: &str) -> ModbusResult<RegisterBlock> {
        let index = self.index_of(name)?;
        Ok(self.blocks.remove(index))
    }

    pub fn block(&self, name: &str) -> Option<&RegisterBlock> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn block_names(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.name.clone()).collect()
    }

    /// Write cells at a 0-based offset into the named block
    pub fn set_values(&mut self, name: &str, offset: usize, values: &[u16]) -> ModbusResult<()> {
        let index = self.index_of(name)?;
        self.blocks[index].set(offset, values)
    }

    /// Read `count` cells at a 0-based offset into the named block
    pub fn get_values(&self, name: &str, offset: usize, count: usize) -> ModbusResult<Vec<u16>> {
        let index = self.index_of(name)?;
        Ok(self.blocks[index].get(offset, count)?.to_vec())
    }

    /// Boolean view of a bit block
    pub fn get_coils(&self, name: &str, offset: usize, count: usize) -> ModbusResult<Vec<bool>> {
        let index = self.bit_block(name)?;
        Ok(self.blocks[index]
            .get(offset, count)?
            .iter()
            .map(|&v| v != 0)
            .collect())
    }

    pub fn set_coils(&mut self, name: &str, offset: usize, values: &[bool]) -> ModbusResult<()> {
        let index = self.bit_block(name)?;
        let cells: Vec<u16> = values.iter().map(|&on| u16::from(on)).collect();
        self.blocks[index].set(offset, &cells)
    }

    /// Read by protocol address, as a master request does
    pub fn read(&self, kind: BlockKind, address: u16, count: u16) -> ModbusResult<Vec<u16>> {
        let block = self.covering(kind, address, count)?;
        let offset = (address - block.start_address) as usize;
        Ok(block.get(offset, count as usize)?.to_vec())
    }

    /// Write by protocol address, as a master request does
    pub fn write(&mut self, kind: BlockKind, address: u16, values: &[u16]) -> ModbusResult<()> {
        let count = values.len() as u16;
        let index = self
            .blocks
            .iter()
            .position(|b| b.kind == kind && b.covers(address, values.len()))
            .ok_or_else(|| unmapped(kind, address, count))?;
        let block = &mut self.blocks[index];
        let offset = (address - block.start_address) as usize;
        block.set(offset, values)
    }

    fn covering(&self, kind: BlockKind, address: u16, count: u16) -> ModbusResult<&RegisterBlock> {
        self.blocks
            .iter()
            .find(|b| b.kind == kind && b.covers(address, count as usize))
            .ok_or_else(|| unmapped(kind, address, count))
    }

    fn index_of(&self, name: &str) -> ModbusResult<usize> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| ModbusError::UnknownBlock {
                name: name.to_string(),
            })
    }

    fn bit_block(&self, name: &str) -> ModbusResult<usize> {
        let index = self.index_of(name)?;
        if !self.blocks[index].kind.is_bit() {
            return Err(ModbusError::invalid_data(format!(
                "Block '{}' holds {}, not bits",
                name, self.blocks[index].kind
            )));
        }
        Ok(index)
    }
}

fn unmapped(kind: BlockKind, address: u16, count: u16) -> ModbusError {
    ModbusError::AddressNotMapped {
        table: kind.to_string(),
        address,
        count,
    }
}

/// Shared handle to one slave's blocks.
///
/// Returned by `RtuServer::add_slave`; the application keeps it to seed and
/// inspect values while the slave engine serves requests from the same
/// store.
#[derive(Debug, Clone)]
pub struct SlaveHandle {
    store: Arc<RwLock<SlaveStore>>,
    slave_id: SlaveId,
}

impl SlaveHandle {
    pub fn new(slave_id: SlaveId) -> Self {
        Self {
            store: Arc::new(RwLock::new(SlaveStore::new(slave_id))),
            slave_id,
        }
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    pub fn add_block(
        &self,
        name: &str,
        kind: BlockKind,
        start_address: u16,
        length: usize,
    ) -> ModbusResult<()> {
        self.write_store().add_block(name, kind, start_address, length)
    }

    pub fn remove_block(&self, name: &str) -> ModbusResult<RegisterBlock> {
        self.write_store().remove_block(name)
    }

    pub fn block_names(&self) -> Vec<String> {
        self.read_store().block_names()
    }

    pub fn set_values(&self, name: &str, offset: usize, values: &[u16]) -> ModbusResult<()> {
        self.write_store().set_values(name, offset, values)
    }

    pub fn get_values(&self, name: &str, offset: usize, count: usize) -> ModbusResult<Vec<u16>> {
        self.read_store().get_values(name, offset, count)
    }

    pub fn set_coils(&self, name: &str, offset: usize, values: &[bool]) -> ModbusResult<()> {
        self.write_store().set_coils(name, offset, values)
    }

    pub fn get_coils(&self, name: &str, offset: usize, count: usize) -> ModbusResult<Vec<bool>> {
        self.read_store().get_coils(name, offset, count)
    }

    pub(crate) fn read_store(&self) -> RwLockReadGuard<'_, SlaveStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_store(&self) -> RwLockWriteGuard<'_, SlaveStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_holding() -> SlaveStore {
        let mut store = SlaveStore::new(0x66);
        store
            .add_block("test", BlockKind::HoldingRegisters, 0, 10)
            .unwrap();
        store
    }

    #[test]
    fn test_set_then_get() {
        let mut store = store_with_holding();
        store.set_values("test", 0, &[7, 1, 5]).unwrap();
        assert_eq!(store.get_values("test", 0, 3).unwrap(), vec![7, 1, 5]);
        assert_eq!(store.get_values("test", 3, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_out_of_range() {
        let mut store = store_with_holding();
        assert!(store.set_values("test", 8, &[1, 2]).is_ok());
        let err = store.set_values("test", 8, &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            ModbusError::OutOfRange {
                offset: 8,
                count: 3,
                length: 10,
                ..
            }
        ));
        assert!(store.get_values("test", 0, 11).is_err());
        assert!(store.get_values("test", usize::MAX, 2).is_err());
    }

    #[test]
    fn test_duplicate_block() {
        let mut store = store_with_holding();
        let err = store
            .add_block("test", BlockKind::Coils, 100, 4)
            .unwrap_err();
        assert_eq!(
            err,
            ModbusError::DuplicateBlock {
                name: "test".into()
            }
        );
    }

    #[test]
    fn test_overlap_only_within_kind() {
        let mut store = store_with_holding();
        assert!(matches!(
            store.add_block("other", BlockKind::HoldingRegisters, 9, 2),
            Err(ModbusError::OverlappingBlock { .. })
        ));
        store
            .add_block("adjacent", BlockKind::HoldingRegisters, 10, 2)
            .unwrap();
        store.add_block("inputs", BlockKind::InputRegisters, 0, 10).unwrap();
    }

    #[test]
    fn test_block_bounds() {
        let mut store = SlaveStore::new(1);
        assert!(store.add_block("empty", BlockKind::Coils, 0, 0).is_err());
        assert!(store.add_block("wrap", BlockKind::Coils, 0xFFFF, 2).is_err());
        store.add_block("last", BlockKind::Coils, 0xFFFF, 1).unwrap();
    }

    #[test]
    fn test_address_based_access() {
        let mut store = SlaveStore::new(2);
        store.add_block("temp", BlockKind::InputRegisters, 1, 4).unwrap();
        store.set_values("temp", 0, &[250, 260, 270, 280]).unwrap();

        assert_eq!(store.read(BlockKind::InputRegisters, 2, 2).unwrap(), vec![260, 270]);
        assert!(matches!(
            store.read(BlockKind::InputRegisters, 0, 1),
            Err(ModbusError::AddressNotMapped { address: 0, .. })
        ));
        assert!(store.read(BlockKind::InputRegisters, 4, 2).is_err());
        assert!(store.read(BlockKind::HoldingRegisters, 1, 1).is_err());
    }

    #[test]
    fn test_coil_views() {
        let mut store = SlaveStore::new(1);
        store.add_block("relay", BlockKind::Coils, 0, 8).unwrap();
        store.set_coils("relay", 0, &[true, false, true]).unwrap();
        assert_eq!(store.get_values("relay", 0, 3).unwrap(), vec![1, 0, 1]);

        store.write(BlockKind::Coils, 3, &[0xFF00]).unwrap();
        assert_eq!(
            store.get_coils("relay", 0, 4).unwrap(),
            vec![true, false, true, true]
        );

        store.add_block("regs", BlockKind::HoldingRegisters, 0, 2).unwrap();
        assert!(matches!(
            store.get_coils("regs", 0, 1),
            Err(ModbusError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_coil_wire_encoding() {
        assert_eq!(coil_to_wire(true), 0xFF00);
        assert_eq!(coil_to_wire(false), 0x0000);
        assert!(coil_from_wire(0xFF00).unwrap());
        assert!(!coil_from_wire(0x0000).unwrap());
        assert!(coil_from_wire(0x0001).is_err());
    }

    #[test]
    fn test_handle_shares_store() {
        let handle = SlaveHandle::new(0x66);
        let other = handle.clone();
        handle
            .add_block("test", BlockKind::HoldingRegisters, 0, 10)
            .unwrap();
        other.set_values("test", 0, &[9, 9, 3, 9, 9]).unwrap();
        assert_eq!(handle.get_values("test", 0, 5).unwrap(), vec![9, 9, 3, 9, 9]);
        assert_eq!(handle.block_names(), vec!["test".to_string()]);

        handle.remove_block("test").unwrap();
        assert!(matches!(
            other.get_values("test", 0, 1),
            Err(ModbusError::UnknownBlock { .. })
        ));
    }
}
