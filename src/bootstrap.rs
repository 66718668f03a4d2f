//! Phone-family detection and loader upload.
//!
//! Bit-exact against `cmd/unixserver/unixserver.go` (which plays the role of
//! the phone side of this handshake for the emulator) and
//! `pkg/pmb887x/chaosloader.go`.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::bytestream::ByteStream;
use crate::error::{Error, Result};

const AT_SPAM_INTERVAL: Duration = Duration::from_millis(100);
const POST_FRAME_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneFamily {
    Sgold,
    Sgold2,
}

/// Drives the bootstrap handshake to completion: wait for the family byte
/// (spamming `AT` meanwhile on a separate task), upload the framed loader,
/// and wait for the ack.
pub async fn boot<S: ByteStream + 'static>(stream: S, loader: &[u8]) -> Result<(S, PhoneFamily)> {
    let stream = Arc::new(Mutex::new(stream));
    let (family_tx, mut family_rx) = mpsc::channel::<u8>(1);

    let spammer_stream = stream.clone();
    let spammer = tokio::spawn(async move {
        loop {
            {
                let mut s = spammer_stream.lock().await;
                if s.write_all(b"AT").await.is_err() {
                    return;
                }
            }
            sleep(AT_SPAM_INTERVAL).await;
        }
    });

    let reader_stream = stream.clone();
    let reader = tokio::spawn(async move {
        let mut byte = [0u8; 1];
        loop {
            let n = {
                let mut s = reader_stream.lock().await;
                match s.read(&mut byte).await {
                    Ok(n) => n,
                    Err(_) => return,
                }
            };
            if n == 0 {
                continue;
            }
            if byte[0] == 0xB0 || byte[0] == 0xC0 {
                let _ = family_tx.send(byte[0]).await;
                return;
            }
        }
    });

    let family_byte = family_rx
        .recv()
        .await
        .ok_or_else(|| Error::LinkClosed("bootstrap reader exited without a family byte".into()))?;
    spammer.abort();
    let _ = spammer.await;
    let _ = reader.await;

    let family = match family_byte {
        0xB0 => PhoneFamily::Sgold,
        0xC0 => PhoneFamily::Sgold2,
        other => return Err(Error::UnknownFamily(other)),
    };
    info!("detected phone family {family:?}");

    let stream = Arc::try_unwrap(stream).map_err(|_| {
        Error::ProtocolError("bootstrap tasks still hold the stream after joining".to_string())
    })?;
    let mut stream = stream.into_inner();

    let frame = build_loader_frame(loader);
    for byte in &frame {
        stream.write_all(&[*byte]).await?;
    }
    sleep(POST_FRAME_DELAY).await;

    let mut ack = [0u8; 1];
    crate::bytestream::read_exact(&mut stream, &mut ack, Duration::from_secs(5)).await?;
    match ack[0] {
        0xB1 | 0xC1 => {
            debug!("loader upload acked");
            Ok((stream, family))
        }
        0x1B | 0x1C => Err(Error::BootRejected),
        other => Err(Error::UnknownAck(other)),
    }
}

/// Header `{0x30, ldrLen_lo, ldrLen_hi}` + raw loader bytes + trailing XOR
/// checksum byte.
fn build_loader_frame(loader: &[u8]) -> Vec<u8> {
    let len = loader.len() as u16;
    let mut frame = Vec::with_capacity(3 + loader.len() + 1);
    frame.push(0x30);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(loader);
    let checksum = loader.iter().fold(0u8, |acc, &b| acc ^ b);
    frame.push(checksum);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_frame_header_and_checksum() {
        let loader = vec![0x01, 0x02, 0x03, 0x04];
        let frame = build_loader_frame(&loader);
        assert_eq!(frame[0], 0x30);
        assert_eq!(u16::from_le_bytes([frame[1], frame[2]]), 4);
        assert_eq!(&frame[3..7], &loader[..]);
        assert_eq!(frame[7], 0x01 ^ 0x02 ^ 0x03 ^ 0x04);
    }
}
