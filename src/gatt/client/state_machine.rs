//! The CLCB dispatch table. Every (state, event) pair maps to exactly one
//! next state and one action; pairs with nothing to do map to Ignore.
//!
//! The next state is committed before the action runs, so an action may
//! override it (e.g. a CLCB joining a discovery already in flight).

use log::{debug, warn};

use crate::gatt::{
    cache_store::CacheEntry,
    callbacks::DisconnectReason,
    channel::{GattOpType, OperationPayload},
    ids::ConnectionId,
    status::{CacheLoadStatus, GattStatus},
};

use super::{
    clcb::{
        ClcbId, ClcbState, ConfirmRequest, ExecuteWriteRequest, ReadMultipleRequest, ReadRequest,
        SearchRequest, WriteRequest,
    },
    GattClientModule,
};

/// A transport completion for a read, write or execute-write
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct OperationCompletion {
    pub op: GattOpType,
    pub status: GattStatus,
    pub payload: Option<OperationPayload>,
}

/// Events driving a CLCB
#[derive(Debug)]
pub(crate) enum ClcbEvent {
    ApiOpen,
    ApiCancelOpen,
    IntCancelOpenOk,
    /// The connection attempt failed with this status
    IntOpenFail(GattStatus),
    ApiRead(ReadRequest),
    ApiReadMultiple(ReadMultipleRequest),
    ApiWrite(WriteRequest),
    ApiExecuteWrite(ExecuteWriteRequest),
    ApiConfirm(ConfirmRequest),
    ApiSearch(SearchRequest),
    ApiClose,
    IntConnected(ConnectionId),
    IntDisconnected(DisconnectReason),
    IntDiscover,
    DiscoverComplete,
    OperationComplete(OperationCompletion),
    StartCache,
    CacheOpened(GattStatus),
    CacheLoaded(CacheLoadStatus, Vec<CacheEntry>),
    CacheSaved(GattStatus),
}

impl ClcbEvent {
    fn name(&self) -> &'static str {
        match self {
            ClcbEvent::ApiOpen => "API_OPEN",
            ClcbEvent::ApiCancelOpen => "API_CANCEL_OPEN",
            ClcbEvent::IntCancelOpenOk => "INT_CANCEL_OPEN_OK",
            ClcbEvent::IntOpenFail(_) => "INT_OPEN_FAIL",
            ClcbEvent::ApiRead(_) => "API_READ",
            ClcbEvent::ApiReadMultiple(_) => "API_READ_MULTIPLE",
            ClcbEvent::ApiWrite(_) => "API_WRITE",
            ClcbEvent::ApiExecuteWrite(_) => "API_EXECUTE_WRITE",
            ClcbEvent::ApiConfirm(_) => "API_CONFIRM",
            ClcbEvent::ApiSearch(_) => "API_SEARCH",
            ClcbEvent::ApiClose => "API_CLOSE",
            ClcbEvent::IntConnected(_) => "INT_CONNECTED",
            ClcbEvent::IntDisconnected(_) => "INT_DISCONNECTED",
            ClcbEvent::IntDiscover => "INT_DISCOVER",
            ClcbEvent::DiscoverComplete => "DISCOVER_COMPLETE",
            ClcbEvent::OperationComplete(_) => "OP_COMPLETE",
            ClcbEvent::StartCache => "START_CACHE",
            ClcbEvent::CacheOpened(_) => "CI_CACHE_OPEN",
            ClcbEvent::CacheLoaded(..) => "CI_CACHE_LOAD",
            ClcbEvent::CacheSaved(_) => "CI_CACHE_SAVE",
        }
    }

    fn is_api_operation(&self) -> bool {
        matches!(
            self,
            ClcbEvent::ApiRead(_)
                | ClcbEvent::ApiReadMultiple(_)
                | ClcbEvent::ApiWrite(_)
                | ClcbEvent::ApiExecuteWrite(_)
                | ClcbEvent::ApiConfirm(_)
                | ClcbEvent::ApiSearch(_)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClcbAction {
    Open,
    OpenError,
    OpenFail,
    CancelOpen,
    CancelOpenOk,
    CancelOpenError,
    Connected,
    Close,
    DiscoveryClose,
    StartDiscovery,
    RestartDiscovery,
    DiscoveryComplete,
    Read,
    ReadMultiple,
    Write,
    ExecuteWrite,
    Confirm,
    Search,
    QueueCommand,
    Fail,
    OperationComplete,
    IgnoreOperationComplete,
    CacheOpen,
    CacheOpened,
    CacheLoaded,
    CacheSaved,
    Ignore,
}

impl ClcbState {
    /// Look up the next state and action for an event
    pub(crate) fn transition(self, event: &ClcbEvent) -> (ClcbState, ClcbAction) {
        match self {
            ClcbState::Idle => idle(event),
            ClcbState::Connecting => connecting(event),
            ClcbState::Connected => connected(event),
            ClcbState::Discovering => discovering(event),
            ClcbState::Closing => (ClcbState::Closing, ClcbAction::Ignore),
        }
    }
}

fn idle(event: &ClcbEvent) -> (ClcbState, ClcbAction) {
    use ClcbAction as A;
    use ClcbState as S;
    match event {
        ClcbEvent::ApiOpen => (S::Connecting, A::Open),
        ClcbEvent::IntOpenFail(_) => (S::Idle, A::OpenFail),
        ClcbEvent::ApiCancelOpen => (S::Idle, A::CancelOpenError),
        ClcbEvent::IntCancelOpenOk => (S::Idle, A::CancelOpenOk),
        ClcbEvent::ApiClose => (S::Closing, A::Close),
        ClcbEvent::IntConnected(_) => (S::Connected, A::Connected),
        event if event.is_api_operation() => (S::Idle, A::Fail),
        _ => (S::Idle, A::Ignore),
    }
}

fn connecting(event: &ClcbEvent) -> (ClcbState, ClcbAction) {
    use ClcbAction as A;
    use ClcbState as S;
    match event {
        ClcbEvent::ApiOpen => (S::Connecting, A::Open),
        ClcbEvent::IntOpenFail(_) => (S::Idle, A::OpenFail),
        ClcbEvent::ApiCancelOpen => (S::Connecting, A::CancelOpen),
        ClcbEvent::IntCancelOpenOk => (S::Idle, A::CancelOpenOk),
        ClcbEvent::ApiClose => (S::Closing, A::Close),
        ClcbEvent::IntConnected(_) => (S::Connected, A::Connected),
        ClcbEvent::IntDisconnected(_) => (S::Idle, A::OpenFail),
        event if event.is_api_operation() => (S::Connecting, A::Fail),
        _ => (S::Connecting, A::Ignore),
    }
}

fn connected(event: &ClcbEvent) -> (ClcbState, ClcbAction) {
    use ClcbAction as A;
    use ClcbState as S;
    match event {
        ClcbEvent::ApiOpen => (S::Connected, A::OpenError),
        ClcbEvent::ApiCancelOpen => (S::Connected, A::CancelOpenError),
        ClcbEvent::ApiRead(_) => (S::Connected, A::Read),
        ClcbEvent::ApiReadMultiple(_) => (S::Connected, A::ReadMultiple),
        ClcbEvent::ApiWrite(_) => (S::Connected, A::Write),
        ClcbEvent::ApiExecuteWrite(_) => (S::Connected, A::ExecuteWrite),
        ClcbEvent::ApiConfirm(_) => (S::Connected, A::Confirm),
        ClcbEvent::ApiSearch(_) => (S::Connected, A::Search),
        ClcbEvent::ApiClose | ClcbEvent::IntDisconnected(_) => (S::Closing, A::Close),
        ClcbEvent::IntConnected(_) => (S::Connected, A::Connected),
        ClcbEvent::IntDiscover => (S::Discovering, A::StartDiscovery),
        ClcbEvent::StartCache => (S::Discovering, A::CacheOpen),
        ClcbEvent::OperationComplete(_) => (S::Connected, A::OperationComplete),
        _ => (S::Connected, A::Ignore),
    }
}

fn discovering(event: &ClcbEvent) -> (ClcbState, ClcbAction) {
    use ClcbAction as A;
    use ClcbState as S;
    match event {
        ClcbEvent::ApiOpen => (S::Discovering, A::OpenError),
        ClcbEvent::ApiCancelOpen => (S::Discovering, A::CancelOpenError),
        ClcbEvent::ApiClose | ClcbEvent::IntDisconnected(_) => (S::Closing, A::DiscoveryClose),
        ClcbEvent::IntDiscover => (S::Discovering, A::RestartDiscovery),
        ClcbEvent::DiscoverComplete => (S::Connected, A::DiscoveryComplete),
        ClcbEvent::OperationComplete(_) => (S::Discovering, A::IgnoreOperationComplete),
        ClcbEvent::CacheOpened(_) => (S::Discovering, A::CacheOpened),
        ClcbEvent::CacheLoaded(..) => (S::Discovering, A::CacheLoaded),
        ClcbEvent::CacheSaved(_) => (S::Discovering, A::CacheSaved),
        event if event.is_api_operation() => (S::Discovering, A::QueueCommand),
        _ => (S::Discovering, A::Ignore),
    }
}

impl GattClientModule {
    /// Run one event through a CLCB's state machine
    pub(crate) fn sm_execute(&mut self, id: ClcbId, event: ClcbEvent) {
        let Some(clcb) = self.clcbs.get_mut(&id) else {
            warn!("dropping {} for deallocated clcb {id:?}", event.name());
            return;
        };
        let (next, action) = clcb.state.transition(&event);
        debug!("clcb {id:?}: {:?} --{}--> {next:?} ({action:?})", clcb.state, event.name());
        clcb.state = next;
        self.run_action(id, action, event);
    }

    fn run_action(&mut self, id: ClcbId, action: ClcbAction, event: ClcbEvent) {
        match (action, event) {
            (ClcbAction::Open, _) => self.open_action(id),
            (ClcbAction::OpenError, _) => self.open_error(id),
            (ClcbAction::OpenFail, ClcbEvent::IntOpenFail(status)) => self.open_fail(id, status),
            (ClcbAction::OpenFail, _) => self.open_fail(id, GattStatus::Error),
            (ClcbAction::CancelOpen, _) => self.cancel_open_action(id),
            (ClcbAction::CancelOpenOk, _) => self.cancel_open_ok(id),
            (ClcbAction::CancelOpenError, _) => self.cancel_open_error(id),
            (ClcbAction::Connected, ClcbEvent::IntConnected(conn_id)) => {
                self.connected_action(id, conn_id)
            }
            (ClcbAction::Close, event) => self.close_action(id, event),
            (ClcbAction::DiscoveryClose, event) => self.discovery_close(id, event),
            (ClcbAction::StartDiscovery, _) => self.start_discovery(id),
            (ClcbAction::RestartDiscovery, _) => self.restart_discovery(id),
            (ClcbAction::DiscoveryComplete, _) => self.discovery_complete(id),
            (ClcbAction::Read, ClcbEvent::ApiRead(req)) => self.read_action(id, req),
            (ClcbAction::ReadMultiple, ClcbEvent::ApiReadMultiple(req)) => {
                self.read_multiple_action(id, req)
            }
            (ClcbAction::Write, ClcbEvent::ApiWrite(req)) => self.write_action(id, req),
            (ClcbAction::ExecuteWrite, ClcbEvent::ApiExecuteWrite(req)) => {
                self.execute_write_action(id, req)
            }
            (ClcbAction::Confirm, ClcbEvent::ApiConfirm(req)) => self.confirm_action(id, req),
            (ClcbAction::Search, ClcbEvent::ApiSearch(req)) => self.search_action(id, req),
            (ClcbAction::QueueCommand, event) => self.queue_command(id, event),
            (ClcbAction::Fail, event) => self.fail_action(id, event),
            (ClcbAction::OperationComplete, ClcbEvent::OperationComplete(completion)) => {
                self.operation_complete(id, completion)
            }
            (ClcbAction::IgnoreOperationComplete, ClcbEvent::OperationComplete(completion)) => {
                debug!("clcb {id:?}: ignoring {:?} completion during discovery", completion.op)
            }
            (ClcbAction::CacheOpen, _) => self.cache_open(id),
            (ClcbAction::CacheOpened, ClcbEvent::CacheOpened(status)) => {
                self.cache_opened(id, status)
            }
            (ClcbAction::CacheLoaded, ClcbEvent::CacheLoaded(status, entries)) => {
                self.cache_loaded(id, status, entries)
            }
            (ClcbAction::CacheSaved, ClcbEvent::CacheSaved(status)) => self.cache_saved(id, status),
            (ClcbAction::Ignore, event) => {
                debug!("clcb {id:?}: ignoring {}", event.name())
            }
            (action, event) => warn!("clcb {id:?}: {action:?} cannot handle {}", event.name()),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::gatt::ids::{ClientIf, TransportIndex};

    use super::*;

    const CONN_ID: ConnectionId = ConnectionId::new(TransportIndex(1), ClientIf(1));

    fn all_events() -> Vec<ClcbEvent> {
        vec![
            ClcbEvent::ApiOpen,
            ClcbEvent::ApiCancelOpen,
            ClcbEvent::IntCancelOpenOk,
            ClcbEvent::IntOpenFail(GattStatus::Error),
            ClcbEvent::ApiSearch(SearchRequest { service_uuid: None }),
            ClcbEvent::ApiExecuteWrite(ExecuteWriteRequest { is_execute: true }),
            ClcbEvent::ApiClose,
            ClcbEvent::IntConnected(CONN_ID),
            ClcbEvent::IntDisconnected(DisconnectReason::UNKNOWN),
            ClcbEvent::IntDiscover,
            ClcbEvent::DiscoverComplete,
            ClcbEvent::OperationComplete(OperationCompletion {
                op: GattOpType::Read,
                status: GattStatus::Success,
                payload: None,
            }),
            ClcbEvent::StartCache,
            ClcbEvent::CacheOpened(GattStatus::Success),
            ClcbEvent::CacheLoaded(CacheLoadStatus::Complete, vec![]),
            ClcbEvent::CacheSaved(GattStatus::Success),
        ]
    }

    #[test]
    fn test_closing_ignores_everything() {
        for event in all_events() {
            assert_eq!(
                ClcbState::Closing.transition(&event),
                (ClcbState::Closing, ClcbAction::Ignore),
                "{}",
                event.name()
            );
        }
    }

    #[test]
    fn test_operations_queue_during_discovery() {
        let event = ClcbEvent::ApiExecuteWrite(ExecuteWriteRequest { is_execute: false });
        assert_eq!(
            ClcbState::Discovering.transition(&event),
            (ClcbState::Discovering, ClcbAction::QueueCommand)
        );
    }

    #[test]
    fn test_operations_fail_before_connection() {
        let event = ClcbEvent::ApiSearch(SearchRequest { service_uuid: None });
        assert_eq!(ClcbState::Idle.transition(&event), (ClcbState::Idle, ClcbAction::Fail));
        assert_eq!(
            ClcbState::Connecting.transition(&event),
            (ClcbState::Connecting, ClcbAction::Fail)
        );
    }

    #[test]
    fn test_disconnect_while_connecting_is_open_failure() {
        let event = ClcbEvent::IntDisconnected(DisconnectReason::UNKNOWN);
        assert_eq!(
            ClcbState::Connecting.transition(&event),
            (ClcbState::Idle, ClcbAction::OpenFail)
        );
    }

    #[test]
    fn test_discovery_close_from_discovering() {
        assert_eq!(
            ClcbState::Discovering.transition(&ClcbEvent::ApiClose),
            (ClcbState::Closing, ClcbAction::DiscoveryClose)
        );
    }
}
