//! Command-dispatch capability of a paused execution context.

use futures_util::future::BoxFuture;

use crate::models::session::BreakpointLocation;
use crate::protocol::Command;

/// A paused frame the bridge can inspect on behalf of a remote client.
///
/// Flow control (stepping, continuation, descend) is decided by the bridge
/// and reported to the owning unit through [`super::Resume`]; the frame only
/// answers inspection commands and exposes the unit's last nested call.
pub trait Frame: Send {
    /// Where the unit is paused.
    fn location(&self) -> BreakpointLocation;

    /// Text shown whenever the unit stops: position plus current source line.
    fn banner(&self) -> String;

    /// Answer an inspection-class command. Output is sent verbatim.
    fn dispatch(&mut self, command: &Command) -> String;

    /// Future resolving to the textual result of the unit's most recent
    /// nested call, or `None` when the unit has issued none.
    fn pending_result(&self) -> Option<BoxFuture<'static, String>> {
        None
    }
}
