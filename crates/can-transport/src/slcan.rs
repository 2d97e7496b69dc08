use crate::{BusInfo, CanBus, CanFrame, CanId, Result, TransportError};
use serialport::{SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// SLCAN (Lawicel) text protocol over a serial port, common on USB-CAN
/// dongles. Frames arrive as CR-terminated ASCII records:
/// `t<id:3><dlc:1><data...>` for base frames, `T<id:8><dlc:1><data...>` for
/// extended frames, lowercase/uppercase `r`/`R` for remote frames.
pub struct SlcanBus {
    port: Box<dyn SerialPort>,
    line: Vec<u8>,
}

impl SlcanBus {
    pub fn open_with(path: &str, bitrate: Option<SlcanBitrate>) -> Result<Self> {
        let mut port = serialport::new(path, 115_200)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        // Close the channel, program the bitrate, reopen.
        write_cmd(&mut *port, b"C\r")?;
        let rate = bitrate.unwrap_or(SlcanBitrate::B500k);
        write_cmd(&mut *port, &[b'S', rate.code(), b'\r'])?;
        write_cmd(&mut *port, b"O\r")?;
        tracing::debug!(path, ?rate, "slcan channel open");
        Ok(Self {
            port,
            line: Vec::with_capacity(64),
        })
    }

    fn next_record(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if let Some(t) = timeout {
            self.port.set_timeout(t).ok();
        }
        let mut buf = [0u8; 128];
        loop {
            if let Some(pos) = self.line.iter().position(|&b| b == b'\r') {
                let record: Vec<u8> = self.line.drain(..=pos).collect();
                let record = record[..record.len() - 1].to_vec();
                if record.is_empty() {
                    continue;
                }
                return Ok(record);
            }
            match self.port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.line.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout)
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }
}

fn write_cmd(port: &mut dyn SerialPort, cmd: &[u8]) -> Result<()> {
    port.write_all(cmd)
        .map_err(|e| TransportError::Io(e.to_string()))
}

fn hex_val(b: u8) -> Result<u32> {
    match b {
        b'0'..=b'9' => Ok(u32::from(b - b'0')),
        b'a'..=b'f' => Ok(u32::from(b - b'a' + 10)),
        b'A'..=b'F' => Ok(u32::from(b - b'A' + 10)),
        _ => Err(TransportError::InvalidFrame("bad hex digit")),
    }
}

fn hex_field(bytes: &[u8]) -> Result<u32> {
    let mut acc = 0u32;
    for &b in bytes {
        acc = (acc << 4) | hex_val(b)?;
    }
    Ok(acc)
}

fn parse_record(record: &[u8]) -> Result<CanFrame> {
    let (kind, rest) = record
        .split_first()
        .ok_or(TransportError::InvalidFrame("empty record"))?;
    let (extended, remote) = match kind {
        b't' => (false, false),
        b'T' => (true, false),
        b'r' => (false, true),
        b'R' => (true, true),
        _ => return Err(TransportError::InvalidFrame("unknown record type")),
    };
    let id_digits = if extended { 8 } else { 3 };
    if rest.len() < id_digits + 1 {
        return Err(TransportError::InvalidFrame("record too short"));
    }
    let raw = hex_field(&rest[..id_digits])?;
    let id = if extended {
        CanId::extended(raw)
    } else {
        CanId::standard(raw as u16)
    }
    .ok_or(TransportError::InvalidFrame("id out of range"))?;

    let dlc = (rest[id_digits] as char)
        .to_digit(10)
        .ok_or(TransportError::InvalidFrame("bad dlc"))? as usize;
    if dlc > 8 {
        return Err(TransportError::InvalidFrame("dlc > 8"));
    }
    let hex = &rest[id_digits + 1..];
    if !remote && hex.len() < dlc * 2 {
        return Err(TransportError::InvalidFrame("truncated data"));
    }
    let mut data = [0u8; 8];
    if !remote {
        for (i, byte) in data.iter_mut().enumerate().take(dlc) {
            *byte = hex_field(&hex[i * 2..i * 2 + 2])? as u8;
        }
    }
    let mut frame = CanFrame::new(id, &data[..dlc])?;
    frame.remote = remote;
    Ok(frame.stamped_now())
}

fn encode_record(frame: &CanFrame) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(28);
    match (frame.id.is_extended(), frame.remote) {
        (true, false) => out.push(b'T'),
        (false, false) => out.push(b't'),
        (true, true) => out.push(b'R'),
        (false, true) => out.push(b'r'),
    }
    if frame.id.is_extended() {
        out.extend_from_slice(format!("{:08X}", frame.id.raw()).as_bytes());
    } else {
        out.extend_from_slice(format!("{:03X}", frame.id.raw()).as_bytes());
    }
    if frame.len > 8 {
        return Err(TransportError::InvalidFrame("dlc > 8"));
    }
    out.push(b'0' + frame.len);
    if !frame.remote {
        for b in frame.payload() {
            out.extend_from_slice(format!("{b:02X}").as_bytes());
        }
    }
    out.push(b'\r');
    Ok(out)
}

impl CanBus for SlcanBus {
    fn open(path: &str) -> Result<Self> {
        Self::open_with(path, None)
    }

    fn list() -> Result<Vec<BusInfo>> {
        let ports =
            serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| BusInfo {
                driver: match p.port_type {
                    SerialPortType::UsbPort(_) => "slcan-serial".to_string(),
                    _ => "serial".to_string(),
                },
                name: p.port_name,
            })
            .collect())
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<CanFrame> {
        let record = self.next_record(timeout)?;
        parse_record(&record)
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let record = encode_record(frame)?;
        self.port
            .write_all(&record)
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Supported SLCAN bitrates (mapped to `Sx` setup codes).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanBitrate {
    B10k,
    B20k,
    B50k,
    B100k,
    B125k,
    B250k,
    B500k,
    B800k,
    B1M,
}

impl SlcanBitrate {
    pub fn code(self) -> u8 {
        match self {
            SlcanBitrate::B10k => b'0',
            SlcanBitrate::B20k => b'1',
            SlcanBitrate::B50k => b'2',
            SlcanBitrate::B100k => b'3',
            SlcanBitrate::B125k => b'4',
            SlcanBitrate::B250k => b'5',
            SlcanBitrate::B500k => b'6',
            SlcanBitrate::B800k => b'7',
            SlcanBitrate::B1M => b'8',
        }
    }
}
