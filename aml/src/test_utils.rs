use crate::{table::SDT_HEADER_LENGTH, Handler};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use log::{LevelFilter, Log, Metadata, Record};
use core::sync::atomic::{AtomicU64, Ordering};
use std::{println, sync::Mutex};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// A handler with a byte-addressed memory and I/O space. Clones share the same memory, so a test can keep one to
/// look at what AML wrote through the other.
#[derive(Clone, Default)]
pub struct TestHandler {
    memory: Arc<Mutex<BTreeMap<usize, u8>>>,
    io: Arc<Mutex<BTreeMap<u16, u8>>>,
}

impl TestHandler {
    pub fn new() -> TestHandler {
        TestHandler::default()
    }

    pub fn poke(&self, address: usize, bytes: &[u8]) {
        let mut memory = self.memory.lock().unwrap();
        for (i, &byte) in bytes.iter().enumerate() {
            memory.insert(address + i, byte);
        }
    }

    pub fn peek(&self, address: usize) -> u8 {
        self.memory.lock().unwrap().get(&address).copied().unwrap_or(0)
    }

    pub fn peek_io(&self, port: u16) -> u8 {
        self.io.lock().unwrap().get(&port).copied().unwrap_or(0)
    }

    fn read(&self, address: usize, width: usize) -> u64 {
        (0..width).fold(0, |value, i| value | (self.peek(address + i) as u64) << (i * 8))
    }

    fn write(&self, address: usize, width: usize, value: u64) {
        let bytes = value.to_le_bytes();
        self.poke(address, &bytes[..width]);
    }

    fn read_io(&self, port: u16, width: u16) -> u64 {
        (0..width).fold(0, |value, i| value | (self.peek_io(port + i) as u64) << (i * 8))
    }

    fn write_io(&self, port: u16, width: u16, value: u64) {
        let mut io = self.io.lock().unwrap();
        for i in 0..width {
            io.insert(port + i, (value >> (i * 8)) as u8);
        }
    }
}

#[rustfmt::skip]
impl Handler for TestHandler {
    fn read_u8(&self, address: usize) -> u8 { self.read(address, 1) as u8 }
    fn read_u16(&self, address: usize) -> u16 { self.read(address, 2) as u16 }
    fn read_u32(&self, address: usize) -> u32 { self.read(address, 4) as u32 }
    fn read_u64(&self, address: usize) -> u64 { self.read(address, 8) }

    fn write_u8(&self, address: usize, value: u8) { self.write(address, 1, value as u64) }
    fn write_u16(&self, address: usize, value: u16) { self.write(address, 2, value as u64) }
    fn write_u32(&self, address: usize, value: u32) { self.write(address, 4, value as u64) }
    fn write_u64(&self, address: usize, value: u64) { self.write(address, 8, value) }

    fn read_io_u8(&self, port: u16) -> u8 { self.read_io(port, 1) as u8 }
    fn read_io_u16(&self, port: u16) -> u16 { self.read_io(port, 2) as u16 }
    fn read_io_u32(&self, port: u16) -> u32 { self.read_io(port, 4) as u32 }

    fn write_io_u8(&self, port: u16, value: u8) { self.write_io(port, 1, value as u64) }
    fn write_io_u16(&self, port: u16, value: u16) { self.write_io(port, 2, value as u64) }
    fn write_io_u32(&self, port: u16, value: u32) { self.write_io(port, 4, value as u64) }

    fn read_pci_u8(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16) -> u8 { 0 }
    fn read_pci_u16(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16) -> u16 { 0 }
    fn read_pci_u32(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16) -> u32 { 0 }
    fn write_pci_u8(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16, _value: u8) {}
    fn write_pci_u16(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16, _value: u16) {}
    fn write_pci_u32(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16, _value: u32) {}

    fn stall(&self, _microseconds: u64) {}
    fn sleep(&self, _milliseconds: u64) {}

    fn thread_id(&self) -> u64 { THREAD_ID.with(|id| *id) }
}

pub struct TestLogger;

impl Log for TestLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        println!("[{:<5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: TestLogger = TestLogger;

/// Install the test logger. Only the first call in a test binary does anything.
pub fn init_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Build a table with a valid header and checksum around `body`.
pub fn make_table(signature: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let length = (SDT_HEADER_LENGTH + body.len()) as u32;
    let mut table = Vec::with_capacity(length as usize);
    table.extend_from_slice(signature);
    table.extend_from_slice(&length.to_le_bytes());
    table.push(2); // Revision
    table.push(0); // Checksum, filled in below
    table.extend_from_slice(b"RUSTOS");
    table.extend_from_slice(b"AMLTESTS");
    table.extend_from_slice(&1u32.to_le_bytes());
    table.extend_from_slice(b"RUST");
    table.extend_from_slice(&1u32.to_le_bytes());
    table.extend_from_slice(body);

    let sum = table.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte));
    table[9] = 0u8.wrapping_sub(sum);
    table
}

/// Prefix `contents` with a `PkgLength` covering both.
pub fn pkg(contents: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(contents.len() + 3);
    if contents.len() + 1 < 0x40 {
        encoded.push((contents.len() + 1) as u8);
    } else if contents.len() + 2 < 0x1000 {
        let length = contents.len() + 2;
        encoded.push(0x40 | (length & 0xf) as u8);
        encoded.push((length >> 4) as u8);
    } else {
        let length = contents.len() + 3;
        assert!(length < 0x10_0000);
        encoded.push(0x80 | (length & 0xf) as u8);
        encoded.push((length >> 4) as u8);
        encoded.push((length >> 12) as u8);
    }
    encoded.extend_from_slice(contents);
    encoded
}

fn pkg_op(opcode: &[u8], contents: &[u8]) -> Vec<u8> {
    let mut op = opcode.to_vec();
    op.extend(pkg(contents));
    op
}

pub fn device(name: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut contents = name.to_vec();
    contents.extend_from_slice(body);
    pkg_op(&[0x5b, 0x82], &contents)
}

pub fn method(name: &[u8; 4], arg_count: u8, body: &[u8]) -> Vec<u8> {
    let mut contents = name.to_vec();
    contents.push(arg_count);
    contents.extend_from_slice(body);
    pkg_op(&[0x14], &contents)
}

pub fn name_op(name: &[u8; 4], value: &[u8]) -> Vec<u8> {
    let mut op = alloc::vec![0x08];
    op.extend_from_slice(name);
    op.extend_from_slice(value);
    op
}

pub fn name_integer(name: &[u8; 4], value: u8) -> Vec<u8> {
    name_op(name, &[0x0a, value])
}

pub fn package(count: u8, elements: &[u8]) -> Vec<u8> {
    let mut contents = alloc::vec![count];
    contents.extend_from_slice(elements);
    pkg_op(&[0x12], &contents)
}

pub fn var_package(count: &[u8], elements: &[u8]) -> Vec<u8> {
    let mut contents = count.to_vec();
    contents.extend_from_slice(elements);
    pkg_op(&[0x13], &contents)
}

pub fn buffer(size: &[u8], bytes: &[u8]) -> Vec<u8> {
    let mut contents = size.to_vec();
    contents.extend_from_slice(bytes);
    pkg_op(&[0x11], &contents)
}

pub fn if_op(predicate: &[u8], body: &[u8]) -> Vec<u8> {
    let mut contents = predicate.to_vec();
    contents.extend_from_slice(body);
    pkg_op(&[0xa0], &contents)
}

pub fn else_op(body: &[u8]) -> Vec<u8> {
    pkg_op(&[0xa1], body)
}

pub fn while_op(predicate: &[u8], body: &[u8]) -> Vec<u8> {
    let mut contents = predicate.to_vec();
    contents.extend_from_slice(body);
    pkg_op(&[0xa2], &contents)
}
