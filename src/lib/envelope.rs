//! Byte framing for encrypted envelopes.
//!
//! Layout, all integers little-endian `i32`:
//!
//! ```text
//! [keyIdLen][keyId utf8][keyVersion][nonceLen][nonce][tagLen][tag][ciphertext...]
//! ```
//!
//! The ciphertext has no length prefix and runs to the end of the frame.

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::error::{Result, VaultError};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub key_id: String,
    pub key_version: u32,
}

impl EncryptedEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(
            4 * 4 + self.key_id.len() + NONCE_LEN + TAG_LEN + self.ciphertext.len(),
        );
        put_len(&mut frame, self.key_id.len())?;
        frame.extend_from_slice(self.key_id.as_bytes());
        let version = i32::try_from(self.key_version).map_err(|_| {
            VaultError::MalformedEnvelope(format!(
                "key version {} does not fit the frame",
                self.key_version
            ))
        })?;
        frame.extend_from_slice(&version.to_le_bytes());
        put_len(&mut frame, NONCE_LEN)?;
        frame.extend_from_slice(&self.nonce);
        put_len(&mut frame, TAG_LEN)?;
        frame.extend_from_slice(&self.tag);
        frame.extend_from_slice(&self.ciphertext);
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(frame);
        let key_id_len = reader.read_len("key id")?;
        let key_id = std::str::from_utf8(reader.take(key_id_len, "key id")?)
            .map_err(|err| VaultError::MalformedEnvelope(format!("key id is not utf-8: {err}")))?
            .to_string();
        let key_version = reader.read_i32("key version")?;
        let key_version = u32::try_from(key_version).map_err(|_| {
            VaultError::MalformedEnvelope(format!("negative key version {key_version}"))
        })?;

        let nonce_len = reader.read_len("nonce")?;
        let nonce: [u8; NONCE_LEN] = reader
            .take(nonce_len, "nonce")?
            .try_into()
            .map_err(|_| {
                VaultError::MalformedEnvelope(format!(
                    "nonce must be {NONCE_LEN} bytes, found {nonce_len}"
                ))
            })?;

        let tag_len = reader.read_len("tag")?;
        let tag: [u8; TAG_LEN] = reader.take(tag_len, "tag")?.try_into().map_err(|_| {
            VaultError::MalformedEnvelope(format!("tag must be {TAG_LEN} bytes, found {tag_len}"))
        })?;

        Ok(Self {
            ciphertext: reader.rest().to_vec(),
            nonce,
            tag,
            key_id,
            key_version,
        })
    }

    /// One text line per record in the event log.
    pub fn encode_line(&self) -> Result<String> {
        Ok(STANDARD.encode(self.encode()?))
    }

    pub fn decode_line(line: &str) -> Result<Self> {
        let frame = STANDARD
            .decode(line.trim())
            .map_err(|err| VaultError::MalformedEnvelope(format!("invalid base64 record: {err}")))?;
        Self::decode(&frame)
    }
}

fn put_len(frame: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = i32::try_from(len)
        .map_err(|_| VaultError::MalformedEnvelope(format!("field length {len} exceeds i32")))?;
    frame.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

struct FrameReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn read_i32(&mut self, field: &str) -> Result<i32> {
        let bytes: [u8; 4] = self
            .take(4, field)?
            .try_into()
            .map_err(|_| VaultError::MalformedEnvelope(format!("truncated {field} header")))?;
        Ok(i32::from_le_bytes(bytes))
    }

    fn read_len(&mut self, field: &str) -> Result<usize> {
        let raw = self.read_i32(field)?;
        usize::try_from(raw)
            .map_err(|_| VaultError::MalformedEnvelope(format!("negative {field} length {raw}")))
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                VaultError::MalformedEnvelope(format!(
                    "{field} overruns frame ({len} bytes at offset {} of {})",
                    self.offset,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }
}
