//! Per-Sync-boundary reply tracking for the extended query flow.
//!
//! Every pipeline the engine writes is a run of statement units, each unit
//! some subset of `Parse`, `Describe`, `Bind`, `Execute`, closed by a single
//! `Sync`. The machine here consumes the backend replies of one pipeline and
//! tells the driver what each message means in its current position.
use crate::protocol::{BackendMessage, ProtocolError, backend};

/// Position within the current statement unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// Before `ParseComplete` of the current unit, or after its result.
    #[default]
    Idle,
    /// `ParseComplete` consumed, statement describe replies may follow.
    Parsed,
    /// `BindComplete` consumed, rows may stream.
    Bound,
}

/// What the driver should do with one backend message.
#[derive(Debug)]
pub enum Reaction {
    /// Bookkeeping message consumed, keep reading.
    Continue,
    /// Result column descriptors for the unit being described.
    Description(backend::RowDescription),
    /// The unit being described returns no rows.
    NoDescription,
    /// Parameter type Oids from a statement describe.
    ParamDescription(backend::ParameterDescription),
    /// One result row of the executing unit.
    Row(backend::DataRow),
    /// The executing unit ran to completion.
    Complete(backend::CommandComplete),
    /// The executing unit was an empty query string.
    CompleteEmpty,
    /// `Execute` hit its row limit; the portal is suspended.
    Suspended,
    /// The Sync boundary: the pipeline is settled, state is back to idle.
    Ready(backend::ReadyForQuery),
    /// The message does not belong in this position.
    Unexpected(ProtocolError),
}

impl PipelineState {
    /// Consume one backend message.
    ///
    /// `ErrorResponse` never reaches here: the transport surfaces it as
    /// `Err`, and the driver records it and drains to the boundary, which is
    /// this table's "record" action.
    pub fn on_message(&mut self, message: BackendMessage) -> Reaction {
        use BackendMessage::*;

        match (*self, message) {
            (Self::Idle, ParseComplete(_)) => {
                *self = Self::Parsed;
                Reaction::Continue
            }
            // Bind of a unit whose Parse was skipped (cached statement)
            (Self::Idle, BindComplete(_)) => {
                *self = Self::Bound;
                Reaction::Continue
            }
            (Self::Parsed, BindComplete(_)) => {
                *self = Self::Bound;
                Reaction::Continue
            }

            // statement describe, before Bind
            (Self::Parsed, ParameterDescription(pd)) => Reaction::ParamDescription(pd),
            (Self::Parsed, RowDescription(rd)) => Reaction::Description(rd),
            (Self::Parsed, NoData(_)) => Reaction::NoDescription,
            (Self::Parsed, EmptyQueryResponse(_)) => Reaction::Continue,

            // portal describe, after Bind
            (Self::Bound, RowDescription(rd)) => Reaction::Description(rd),
            (Self::Bound, NoData(_)) => Reaction::NoDescription,

            (Self::Bound, DataRow(row)) => Reaction::Row(row),
            (Self::Bound, CommandComplete(cmd)) => {
                *self = Self::Idle;
                Reaction::Complete(cmd)
            }
            (Self::Bound, PortalSuspended(_)) => Reaction::Suspended,
            (Self::Bound, EmptyQueryResponse(_)) => {
                *self = Self::Idle;
                Reaction::CompleteEmpty
            }

            // lazy statement close acknowledgements may land anywhere
            (_, CloseComplete(_)) => Reaction::Continue,

            (_, ReadyForQuery(ready)) => {
                *self = Self::Idle;
                Reaction::Ready(ready)
            }

            (_, message) => Reaction::Unexpected(
                ProtocolError::unexpected_phase(message.msgtype(), "extended query"),
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use crate::protocol::BackendProtocol;

    fn msg(msgtype: u8, body: &'static [u8]) -> BackendMessage {
        BackendMessage::decode(msgtype, Bytes::from_static(body)).unwrap()
    }

    #[test]
    fn unit_walks_idle_parsed_bound_idle() {
        let mut state = PipelineState::default();
        assert!(matches!(state.on_message(msg(b'1', b"")), Reaction::Continue));
        assert_eq!(state, PipelineState::Parsed);
        assert!(matches!(state.on_message(msg(b'2', b"")), Reaction::Continue));
        assert_eq!(state, PipelineState::Bound);
        assert!(matches!(
            state.on_message(msg(b'C', b"SELECT 1\0")),
            Reaction::Complete(_),
        ));
        assert_eq!(state, PipelineState::Idle);
    }

    #[test]
    fn cached_statement_skips_parse() {
        let mut state = PipelineState::default();
        assert!(matches!(state.on_message(msg(b'2', b"")), Reaction::Continue));
        assert_eq!(state, PipelineState::Bound);
    }

    #[test]
    fn rows_only_stream_when_bound() {
        let mut state = PipelineState::default();
        assert!(matches!(
            state.on_message(msg(b'D', b"\0\0")),
            Reaction::Unexpected(_),
        ));

        state = PipelineState::Bound;
        assert!(matches!(state.on_message(msg(b'D', b"\0\0")), Reaction::Row(_)));
        // streaming does not change the state
        assert_eq!(state, PipelineState::Bound);
    }

    #[test]
    fn describe_in_both_positions() {
        let mut state = PipelineState::Parsed;
        assert!(matches!(state.on_message(msg(b'T', b"\0\0")), Reaction::Description(_)));
        assert!(matches!(state.on_message(msg(b'n', b"")), Reaction::NoDescription));

        let mut state = PipelineState::Bound;
        assert!(matches!(state.on_message(msg(b'T', b"\0\0")), Reaction::Description(_)));
    }

    #[test]
    fn suspension_keeps_portal_bound() {
        let mut state = PipelineState::Bound;
        assert!(matches!(state.on_message(msg(b's', b"")), Reaction::Suspended));
        assert_eq!(state, PipelineState::Bound);
    }

    #[test]
    fn ready_for_query_resets_any_state() {
        for initial in [PipelineState::Idle, PipelineState::Parsed, PipelineState::Bound] {
            let mut state = initial;
            assert!(matches!(state.on_message(msg(b'Z', b"I")), Reaction::Ready(_)));
            assert_eq!(state, PipelineState::Idle);
        }
    }

    #[test]
    fn stray_command_complete_is_unexpected() {
        let mut state = PipelineState::Idle;
        assert!(matches!(
            state.on_message(msg(b'C', b"SELECT 1\0")),
            Reaction::Unexpected(_),
        ));
    }

    #[test]
    fn close_complete_is_transparent() {
        for initial in [PipelineState::Idle, PipelineState::Parsed, PipelineState::Bound] {
            let mut state = initial;
            assert!(matches!(state.on_message(msg(b'3', b"")), Reaction::Continue));
            assert_eq!(state, initial);
        }
    }
}
