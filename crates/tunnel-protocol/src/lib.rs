//! Wire format for the tunnel control link: frame header, frame types and
//! the pack/unpack codec. Pure, allocation-light, and independent of any
//! particular transport or session state.

pub mod error;
pub mod frame;

pub use error::FrameError;
pub use frame::{Frame, FrameDecoder, FrameType, HEADER_SIZE, MAX_CONNECTION_ID, MAX_PAYLOAD, pack, unpack, write_frame};
