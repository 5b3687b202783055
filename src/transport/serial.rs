//! Serial-line backend for hardware targets.

use std::io;

use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use super::link::Transport;

/// Open `path` at `baud_rate`, 8N1 without flow control.
pub fn open_serial(path: &str, baud_rate: u32) -> io::Result<Transport> {
    let port = tokio_serial::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()?;
    Ok(Transport::from_stream(port, format!("serial://{path}@{baud_rate}")))
}
