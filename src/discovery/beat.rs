use crate::error::{Result, WardenError};

pub const BEAT_HEARTBEAT: u8 = 1;

const BEAT_SIGNAL: &str = "multicast beat";

/// Multicast heartbeat of a forker.
///
/// Little endian layout: type `u8`, signal port `u16`, then application id,
/// isolate id and node id as `u16` length-prefixed UTF-8 strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beat {
    pub port: u16,
    pub app_id: String,
    pub isolate_id: String,
    pub node_id: String,
}

impl Beat {
    pub fn new(
        app_id: impl Into<String>,
        isolate_id: impl Into<String>,
        node_id: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            port,
            app_id: app_id.into(),
            isolate_id: isolate_id.into(),
            node_id: node_id.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut packet = Vec::with_capacity(
            9 + self.app_id.len() + self.isolate_id.len() + self.node_id.len(),
        );
        packet.push(BEAT_HEARTBEAT);
        packet.extend_from_slice(&self.port.to_le_bytes());
        for field in [&self.app_id, &self.isolate_id, &self.node_id] {
            let length = u16::try_from(field.len())
                .map_err(|_| WardenError::malformed(BEAT_SIGNAL, "string too long"))?;
            packet.extend_from_slice(&length.to_le_bytes());
            packet.extend_from_slice(field.as_bytes());
        }
        Ok(packet)
    }

    pub fn decode(packet: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(packet);

        let kind = reader.u8()?;
        if kind != BEAT_HEARTBEAT {
            return Err(WardenError::malformed(
                BEAT_SIGNAL,
                format!("unknown packet type {}", kind),
            ));
        }

        let port = reader.u16()?;
        let app_id = reader.string()?;
        let isolate_id = reader.string()?;
        let node_id = reader.string()?;

        Ok(Self {
            port,
            app_id,
            isolate_id,
            node_id,
        })
    }
}

struct PacketReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PacketReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self.offset + count;
        if end > self.data.len() {
            return Err(WardenError::malformed(
                BEAT_SIGNAL,
                format!("truncated at byte {} of {}", self.data.len(), end),
            ));
        }
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self) -> Result<String> {
        let length = self.u16()? as usize;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WardenError::malformed(BEAT_SIGNAL, e.to_string()))
    }
}
