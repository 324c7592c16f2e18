//! Media utilities for roombridge
//!
//! This crate provides the packet-to-frame side of the relay:
//! - Supported video codecs and their RTP capabilities
//! - Frame reassembly from reordered RTP packets
//! - Conversion of reassembled frames into WebRTC samples

pub mod codec;
pub mod frame;
pub mod reassembler;

pub use codec::VideoCodec;
pub use frame::Frame;
pub use reassembler::{FrameDrop, FrameReassembler, ReassemblerStats, ReassemblyError};
