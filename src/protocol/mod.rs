//! Remote control protocol spoken between the debugger client and a bridge.
//!
//! ## Wire format
//!
//! ```text
//! client → bridge:   ll\n
//! bridge → client:   <zero or more reply lines>(bdb)
//! ```
//!
//! On attach the bridge sends the stop banner followed by the prompt. A
//! continuation-class command is answered by closing the stream. Inside
//! reply text, a prompt or successor line that is payload rather than
//! framing is preceded by a DLE (`0x10`) byte.

pub mod codec;
pub mod command;

pub use codec::{CommandCodec, Reply, ReplyCodec, PROMPT};
pub use command::{Command, CommandClass};
