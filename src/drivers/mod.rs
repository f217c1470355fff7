pub mod crc;
pub mod modbus;
