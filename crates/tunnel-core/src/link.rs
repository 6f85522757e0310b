use std::{
    io,
    net::TcpStream,
    sync::{Arc, Mutex},
};

use tunnel_protocol::{FrameType, write_frame};

use crate::error::TunnelError;

/// The control link's write side, serialized behind a mutex so concurrent
/// writers (the ping loop, the frame dispatch loop, every per-VC writer
/// thread) can never interleave bytes on the wire (spec §5, invariant 3).
///
/// Cloning shares the same underlying write half; the read side is handed
/// out separately by [`ControlLink::split`] since only the frame loop ever
/// reads.
#[derive(Clone)]
pub struct ControlLink {
    write_half: Arc<Mutex<TcpStream>>,
}

impl ControlLink {
    /// Splits a connected stream into a shareable write handle and the
    /// exclusive read half owned by the frame loop.
    pub fn split(stream: TcpStream) -> io::Result<(Self, TcpStream)> {
        let read_half = stream.try_clone()?;
        Ok((Self { write_half: Arc::new(Mutex::new(stream)) }, read_half))
    }

    /// Packs and writes a frame while holding the write mutex for the whole
    /// pack+write+drain tuple, per spec §5.
    pub fn send(&self, frame_type: FrameType, connection_id: u32, payload: &[u8]) -> Result<(), TunnelError> {
        let mut guard = self.write_half.lock().unwrap_or_else(|e| e.into_inner());
        write_frame(&mut *guard, frame_type, connection_id, payload).map_err(TunnelError::Transport)
    }

    pub fn shutdown(&self) {
        if let Ok(guard) = self.write_half.lock() {
            let _ = guard.shutdown(std::net::Shutdown::Both);
        }
    }
}
