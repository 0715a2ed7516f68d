pub mod catalog;
pub mod commands;
pub mod connection;
pub mod modbus;
pub mod output;
pub mod reader;
pub mod record;
