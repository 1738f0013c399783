#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(docsrs, feature(doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(doc)))]

mod debug;
pub mod control;
pub mod descriptor;
pub mod device;
pub mod endpoint;
pub mod function;
pub mod microsoft_os;
pub mod port;
pub mod types;
pub mod wire;

#[cfg(feature = "std")]
pub mod mocks;

/// Size of the shared EP0 buffer
///
/// Must be at least as large as the longest configuration descriptor (or
/// Microsoft OS descriptor set) the mounted functions can produce, and at
/// least as large as the biggest class control data stage (DFU transfer
/// blocks arrive here).
pub const CTRL_BUFFER_SIZE: usize = 512;

/// Endpoint numbers run `0..MAX_EP_COUNT` in each direction
pub const MAX_EP_COUNT: usize = 16;

/// Interface slots available on one device
pub const MAX_INTERFACE_COUNT: usize = 8;

/// Mounted functions available on one device (a function may span two
/// interface slots)
pub const MAX_FUNCTION_COUNT: usize = 8;
