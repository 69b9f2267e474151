//! prpc Common Types and Wire Protocol
//!
//! This crate holds the pieces shared by every prpc component: the binary
//! message codec, payload serializers, body compression and the error type.
//!
//! # Architecture
//!
//! The wire protocol is deliberately small:
//! - **Transport**: one long-lived TCP connection per client/server pair,
//!   multiplexed by a 16-bit sequence number
//! - **Frame**: `[8-byte head] + [body]`, big-endian, total length <= 65535
//! - **Body**: MsgPack `{service_method, payload}`, gzip'd above 2 KiB
//! - **Payload**: MsgPack or JSON, as advertised by the server
//!
//! # Components
//!
//! - [`message`] - Frame head and message pack/unpack
//! - [`codec`] - Payload serializers
//! - [`compress`] - Body compression gate
//! - [`error`] - Error type shared across crates
//!
//! # Example
//!
//! ```
//! use prpc_common::{Codec, Message};
//!
//! # tokio_test();
//! # fn tokio_test() {
//! # let rt = tokio::runtime::Runtime::new().unwrap();
//! # rt.block_on(async {
//! let frame = Message::pack(1, "Arith.Multiply", &(7, 8), Codec::MsgPack).unwrap();
//! let msg = Message::read_from(&mut frame.as_slice()).await.unwrap();
//! assert_eq!(msg.service_method(), "Arith.Multiply");
//! assert_eq!(msg.unpack::<(i32, i32)>(Codec::MsgPack).unwrap(), (7, 8));
//! # });
//! # }
//! ```

pub mod codec;
pub mod compress;
pub mod error;
pub mod message;

pub use codec::{Codec, SerializeType};
pub use error::{PrpcError, Result};
pub use message::{Head, Message, MsgKind};
