//! DATA-frame tokens and the transfer control messages they carry.
//!
//! A token is the two-byte routing key at the front of every DATA payload.
//! Server-to-client FDO streams travel under `AT`; file transfer uses its own
//! tokens so the client can route segments without decoding atoms.
//!
//! Control payloads are big-endian: a 4-byte transfer id followed by the
//! message-specific fields.

use bytes::Bytes;

use crate::wire::WireError;

pub type Token = [u8; 2];

/// FDO atom stream (server → client).
pub const FDO: Token = *b"AT";
/// Sign-on: screen name as text (client → server).
pub const SIGN_ON: Token = *b"SN";

/// Download segment: `[xfer id][bytes]` (server → client).
pub const DOWNLOAD_DATA: Token = *b"F7";
/// Download end: `[xfer id][total size]` (server → client).
pub const DOWNLOAD_END: Token = *b"F9";

/// Client accepted the announced download.
pub const DOWNLOAD_ACK: Token = *b"tA";
/// Client stored the download completely.
pub const DOWNLOAD_CONFIRM: Token = *b"tC";
/// Client cancelled a transfer in either direction.
pub const XFER_CANCEL: Token = *b"tX";

/// Client picked a file to upload: `[xfer id][filename]`.
pub const UPLOAD_PICKED: Token = *b"uP";
/// Client file stats: `[xfer id][size u32]`.
pub const UPLOAD_STATS: Token = *b"uS";
/// Client upload segment: `[xfer id][bytes]`.
pub const UPLOAD_DATA: Token = *b"uD";
/// Client finished streaming: `[xfer id]`.
pub const UPLOAD_END: Token = *b"uE";

/// Render a token for logs, e.g. `"AT"`.
pub fn display(token: &Token) -> String {
    String::from_utf8_lossy(token).into_owned()
}

/// A parsed client → server DATA message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SignOn { screen_name: String },
    DownloadAck { xfer_id: u32 },
    DownloadConfirm { xfer_id: u32 },
    Cancel { xfer_id: u32 },
    UploadPicked { xfer_id: u32, filename: String },
    UploadStats { xfer_id: u32, size: u32 },
    UploadData { xfer_id: u32, data: Bytes },
    UploadEnd { xfer_id: u32 },
    /// Any token this server does not interpret.
    Other { token: Token, data: Bytes },
}

impl ClientMessage {
    pub fn parse(token: Token, data: Bytes) -> Result<Self, WireError> {
        let msg = match token {
            SIGN_ON => ClientMessage::SignOn {
                screen_name: text(&data)?,
            },
            DOWNLOAD_ACK => ClientMessage::DownloadAck {
                xfer_id: xfer_id(&data)?,
            },
            DOWNLOAD_CONFIRM => ClientMessage::DownloadConfirm {
                xfer_id: xfer_id(&data)?,
            },
            XFER_CANCEL => ClientMessage::Cancel {
                xfer_id: xfer_id(&data)?,
            },
            UPLOAD_PICKED => ClientMessage::UploadPicked {
                xfer_id: xfer_id(&data)?,
                filename: text(&data[4..])?,
            },
            UPLOAD_STATS => {
                let id = xfer_id(&data)?;
                let size = data.get(4..8).ok_or(WireError::ShortPayload {
                    need: 8,
                    got: data.len(),
                })?;
                ClientMessage::UploadStats {
                    xfer_id: id,
                    size: u32::from_be_bytes([size[0], size[1], size[2], size[3]]),
                }
            }
            UPLOAD_DATA => ClientMessage::UploadData {
                xfer_id: xfer_id(&data)?,
                data: data.slice(4..),
            },
            UPLOAD_END => ClientMessage::UploadEnd {
                xfer_id: xfer_id(&data)?,
            },
            other => ClientMessage::Other { token: other, data },
        };
        Ok(msg)
    }

    /// Token and body as a client would send them.
    pub fn encode(&self) -> (Token, Vec<u8>) {
        let with_id = |id: u32, rest: &[u8]| {
            let mut v = id.to_be_bytes().to_vec();
            v.extend_from_slice(rest);
            v
        };
        match self {
            ClientMessage::SignOn { screen_name } => (SIGN_ON, screen_name.as_bytes().to_vec()),
            ClientMessage::DownloadAck { xfer_id } => (DOWNLOAD_ACK, with_id(*xfer_id, &[])),
            ClientMessage::DownloadConfirm { xfer_id } => {
                (DOWNLOAD_CONFIRM, with_id(*xfer_id, &[]))
            }
            ClientMessage::Cancel { xfer_id } => (XFER_CANCEL, with_id(*xfer_id, &[])),
            ClientMessage::UploadPicked { xfer_id, filename } => {
                (UPLOAD_PICKED, with_id(*xfer_id, filename.as_bytes()))
            }
            ClientMessage::UploadStats { xfer_id, size } => {
                (UPLOAD_STATS, with_id(*xfer_id, &size.to_be_bytes()))
            }
            ClientMessage::UploadData { xfer_id, data } => (UPLOAD_DATA, with_id(*xfer_id, data)),
            ClientMessage::UploadEnd { xfer_id } => (UPLOAD_END, with_id(*xfer_id, &[])),
            ClientMessage::Other { token, data } => (*token, data.to_vec()),
        }
    }
}

/// Body of a DOWNLOAD_DATA frame.
pub fn download_segment(xfer_id: u32, bytes: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + bytes.len());
    v.extend_from_slice(&xfer_id.to_be_bytes());
    v.extend_from_slice(bytes);
    v
}

/// Body of a DOWNLOAD_END frame.
pub fn download_end(xfer_id: u32, total: u32) -> Vec<u8> {
    let mut v = Vec::with_capacity(8);
    v.extend_from_slice(&xfer_id.to_be_bytes());
    v.extend_from_slice(&total.to_be_bytes());
    v
}

/// Transfer id at the front of a DOWNLOAD_DATA or DOWNLOAD_END body.
pub fn segment_xfer_id(body: &[u8]) -> Option<u32> {
    xfer_id(body).ok()
}

fn xfer_id(data: &[u8]) -> Result<u32, WireError> {
    let b = data.get(..4).ok_or(WireError::ShortPayload {
        need: 4,
        got: data.len(),
    })?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn text(data: &[u8]) -> Result<String, WireError> {
    let s = std::str::from_utf8(data).map_err(|_| WireError::BadText)?;
    Ok(s.trim_end_matches('\0').to_string())
}
