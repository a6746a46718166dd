use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};

use crate::wire::constants::{HEADER_LENGTH, MAX_MSG_LENGTH};
use crate::wire::message::{Command, RawMessage};

/// First 4 bytes of SHA256(SHA256(payload)); every frame carries this over
/// its payload. The empty payload hashes to the well-known `5d f6 e0 e2`.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = Sha256::digest(Sha256::digest(payload));
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Serializes a complete message frame:
///
/// ```text
/// +------------+--------------+---------------+-------------+
/// | magic (4)  | command (12) | length (4 LE) | checksum (4)|
/// +------------+--------------+---------------+-------------+
/// | payload (variable)                                      |
/// +---------------------------------------------------------+
/// ```
pub fn encode_message(magic: u32, command: Command, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len());
    frame.extend_from_slice(&magic.to_le_bytes());
    frame.extend_from_slice(&command.as_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(payload));
    frame.extend_from_slice(payload);
    frame
}

/// Writes a complete message frame to the given writer.
pub fn send_message<W: Write>(
    writer: &mut W,
    magic: u32,
    command: Command,
    payload: &[u8],
) -> io::Result<()> {
    writer.write_all(&encode_message(magic, command, payload))
}

/// Checks the fixed fields of a 24-byte frame header once it is aligned on
/// the magic: command NUL termination and the payload length bound.
pub fn validate_header(header: &[u8; HEADER_LENGTH]) -> Result<(), &'static str> {
    if header[15] != 0 {
        return Err("message type not NUL terminated");
    }
    let length = u32::from_le_bytes(header[16..20].try_into().unwrap());
    if length > MAX_MSG_LENGTH {
        return Err("message length too long");
    }
    Ok(())
}

/// Reads one message frame from any [`Read`] source, resynchronizing on
/// the magic value.
///
/// Bytes preceding the next occurrence of `magic` are discarded one at a
/// time, so a stream error costs exactly the bytes needed to realign. The
/// header is validated (NUL-terminated command, length bound) and the
/// payload checksum is verified before the message is returned.
pub fn read_message<R: Read>(reader: &mut R, magic: u32) -> io::Result<RawMessage> {
    let magic_bytes = magic.to_le_bytes();
    let mut header = [0u8; HEADER_LENGTH];
    let mut len = 0;

    while len < HEADER_LENGTH {
        let n = reader.read(&mut header[len..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed mid-header",
            ));
        }
        len += n;

        // discard one byte at a time until the header starts on the magic
        while len >= 4 && header[..4] != magic_bytes {
            header.copy_within(1..len, 0);
            len -= 1;
        }
    }

    validate_header(&header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let cmd: [u8; 12] = header[4..16].try_into().unwrap();
    let command = Command::from(&cmd);
    let length = u32::from_le_bytes(header[16..20].try_into().unwrap());
    let expected: [u8; 4] = header[20..24].try_into().unwrap();

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;

    if checksum(&payload) != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid payload checksum",
        ));
    }

    Ok(RawMessage {
        magic: magic_bytes,
        command,
        payload,
        checksum: expected,
    })
}
