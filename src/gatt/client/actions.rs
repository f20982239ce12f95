//! The actions run by the CLCB state machine

use log::{debug, error, info, warn};

use crate::{
    core::address::AddressWithType,
    gatt::{
        cache_store::CacheEntry,
        callbacks::{DisconnectReason, GattClientEvent, ReadResult, ReadTarget, WriteResult},
        channel::{
            AttValue, GattOpType, GattWriteRequestType, GattWriteType, OperationPayload, ReadParams,
        },
        ids::{AttHandle, AttributeId, ConnectionId},
        status::{CacheLoadStatus, GattStatus},
    },
};

use super::{
    clcb::{
        AutoUpdate, ClcbId, ClcbState, ConfirmRequest, ExecuteWriteRequest, PendingOperation,
        ReadMultipleRequest, ReadRequest, SearchRequest, WriteRequest,
    },
    server_cache::ServerCacheState,
    state_machine::{ClcbEvent, OperationCompletion},
    GattClientModule,
};

impl GattClientModule {
    pub(super) fn open_action(&mut self, id: ClcbId) {
        let Some(clcb) = self.clcbs.get(&id) else {
            return;
        };
        let (client_if, address) = (clcb.client_if, clcb.address);
        if !self.transport.connect(client_if, address, true) {
            error!("transport refused connection to {address}");
            self.sm_execute(id, ClcbEvent::IntOpenFail(GattStatus::Error));
            return;
        }
        // the link may already be up for another client
        if let Some(conn_id) = self.transport.get_conn_id_if_connected(client_if, address) {
            self.sm_execute(id, ClcbEvent::IntConnected(conn_id));
        }
    }

    pub(super) fn open_error(&mut self, id: ClcbId) {
        let Some(clcb) = self.clcbs.get(&id) else {
            return;
        };
        warn!("connection to {} already open", clcb.address);
        let event = GattClientEvent::Open {
            status: GattStatus::Success,
            client_if: clcb.client_if,
            address: clcb.address,
            conn_id: clcb.conn_id,
        };
        self.send_event(clcb.client_if, event);
    }

    pub(super) fn open_fail(&mut self, id: ClcbId, status: GattStatus) {
        let Some(clcb) = self.dealloc_clcb(id) else {
            return;
        };
        error!("open of {} failed: {status:?}", clcb.address);
        self.send_event(
            clcb.client_if,
            GattClientEvent::Open {
                status,
                client_if: clcb.client_if,
                address: clcb.address,
                conn_id: clcb.conn_id,
            },
        );
        self.maybe_complete_deregistration(clcb.client_if);
    }

    pub(super) fn cancel_open_action(&mut self, id: ClcbId) {
        let Some(clcb) = self.clcbs.get(&id) else {
            return;
        };
        let (client_if, address) = (clcb.client_if, clcb.address);
        if self.transport.cancel_connect(client_if, address, true) {
            self.sm_execute(id, ClcbEvent::IntCancelOpenOk);
        } else {
            self.send_event(
                client_if,
                GattClientEvent::CancelOpen { status: GattStatus::Error, client_if },
            );
        }
    }

    pub(super) fn cancel_open_ok(&mut self, id: ClcbId) {
        let Some(clcb) = self.dealloc_clcb(id) else {
            return;
        };
        let client_if = clcb.client_if;
        self.send_event(
            client_if,
            GattClientEvent::CancelOpen { status: GattStatus::Success, client_if },
        );
        self.maybe_complete_deregistration(client_if);
    }

    pub(super) fn cancel_open_error(&mut self, id: ClcbId) {
        let Some(clcb) = self.clcbs.get(&id) else {
            return;
        };
        let client_if = clcb.client_if;
        error!("cannot cancel open of {} in {:?}", clcb.address, clcb.state);
        self.send_event(
            client_if,
            GattClientEvent::CancelOpen { status: GattStatus::Error, client_if },
        );
    }

    pub(super) fn connected_action(&mut self, id: ClcbId, conn_id: ConnectionId) {
        let Some(clcb) = self.clcbs.get_mut(&id) else {
            return;
        };
        clcb.conn_id = Some(conn_id);
        let (client_if, address) = (clcb.client_if, clcb.address);
        self.links.on_connected(address, conn_id);

        let record = self.record_mut(address);
        record.connected = true;
        if record.cache().is_none() || record.state != ServerCacheState::Idle {
            if record.state == ServerCacheState::Idle {
                record.state = ServerCacheState::Loading;
                self.sm_execute(id, ClcbEvent::StartCache);
            } else if let Some(clcb) = self.clcbs.get_mut(&id) {
                // join the build already in flight
                clcb.state = ClcbState::Discovering;
            }
        } else if record.service_changed_pending {
            record.service_changed_pending = false;
            self.sm_execute(id, ClcbEvent::IntDiscover);
        }

        self.send_event(
            client_if,
            GattClientEvent::Open {
                status: GattStatus::Success,
                client_if,
                address,
                conn_id: Some(conn_id),
            },
        );
    }

    pub(super) fn close_action(&mut self, id: ClcbId, event: ClcbEvent) {
        let Some(clcb) = self.dealloc_clcb(id) else {
            return;
        };
        let (status, reason) = match event {
            ClcbEvent::IntDisconnected(reason) => (GattStatus::Success, reason),
            _ => {
                let status = match clcb.conn_id {
                    Some(conn_id) => self.transport.disconnect(conn_id),
                    None if self.transport.cancel_connect(clcb.client_if, clcb.address, true) => {
                        GattStatus::Success
                    }
                    None => GattStatus::Error,
                };
                (status, DisconnectReason::TERMINATE_LOCAL_HOST)
            }
        };
        info!("closed {:?} to {} ({reason:?})", clcb.conn_id, clcb.address);
        self.send_event(
            clcb.client_if,
            GattClientEvent::Close {
                status,
                client_if: clcb.client_if,
                address: clcb.address,
                conn_id: clcb.conn_id,
                reason,
            },
        );
        self.maybe_complete_deregistration(clcb.client_if);
    }

    pub(super) fn discovery_close(&mut self, id: ClcbId, event: ClcbEvent) {
        if let Some(clcb) = self.clcbs.get(&id) {
            let (address, conn_id) = (clcb.address, clcb.conn_id);
            let build = self
                .servers
                .get(&address)
                .filter(|record| record.state != ServerCacheState::Idle && record.owner == conn_id)
                .map(|record| record.state);
            if let (Some(state), Some(conn_id)) = (build, conn_id) {
                warn!("aborting {state:?} of {address}: owner {conn_id:?} closing");
                if matches!(state, ServerCacheState::Loading | ServerCacheState::Saving) {
                    self.cache_store.close(address, conn_id);
                }
                self.reset_discover_st(address, GattStatus::Cancel);
            }
        }
        self.close_action(id, event);
    }

    /// Finish the record's build and hand DiscoverComplete to every CLCB on it
    pub(super) fn reset_discover_st(&mut self, address: AddressWithType, status: GattStatus) {
        let Some(record) = self.servers.get_mut(&address) else {
            return;
        };
        info!("build of {address} finished: {status:?}");
        record.finish_build();
        if !status.is_success() {
            record.invalidate();
            if status != GattStatus::Cancel {
                self.cache_store.reset(address);
            }
        }

        for id in self.clcbs_for_record(address) {
            // a CLCB may already have started a new build
            if self
                .servers
                .get(&address)
                .is_some_and(|record| record.state != ServerCacheState::Idle)
            {
                break;
            }
            if let Some(clcb) = self.clcbs.get_mut(&id) {
                clcb.status = status;
            }
            self.sm_execute(id, ClcbEvent::DiscoverComplete);
        }
    }

    fn set_discover_st(&mut self, address: AddressWithType) {
        for clcb in self.clcbs.values_mut() {
            if clcb.address == address
                && clcb.conn_id.is_some()
                && matches!(clcb.state, ClcbState::Connected | ClcbState::Discovering)
            {
                clcb.status = GattStatus::Success;
                clcb.state = ClcbState::Discovering;
                clcb.auto_update = AutoUpdate::NoSchedule;
            }
        }
    }

    pub(super) fn start_discovery(&mut self, id: ClcbId) {
        let Some(clcb) = self.clcbs.get(&id) else {
            return;
        };
        let (address, conn_id) = (clcb.address, clcb.conn_id);
        let Some(conn_id) = conn_id else {
            error!("clcb {id:?} cannot discover without a connection");
            return;
        };
        let record_state =
            self.servers.get(&address).map(|record| record.state).unwrap_or(ServerCacheState::Idle);
        let may_start = ((clcb.pending.is_none() || clcb.auto_update == AutoUpdate::RequestWaiting)
            && record_state == ServerCacheState::Idle)
            || record_state == ServerCacheState::PendingDiscovery;

        if !may_start {
            debug!("deferring discovery of {address} on {conn_id:?}");
            if let Some(clcb) = self.clcbs.get_mut(&id) {
                clcb.auto_update = AutoUpdate::DiscoveryWaiting;
                if record_state == ServerCacheState::Idle {
                    clcb.state = ClcbState::Connected;
                }
            }
            return;
        }

        if let Some(clcb) = self.clcbs.get_mut(&id) {
            clcb.auto_update = AutoUpdate::NoSchedule;
        }
        let record = self.record_mut(address);
        record.service_changed_pending = false;
        record.update_count = 0;
        self.set_discover_st(address);
        let request = self.record_mut(address).begin_discovery(conn_id);
        let status = self.transport.discover(conn_id, request);
        if !status.is_success() {
            error!("failed to start discovery of {address}: {status:?}");
            self.reset_discover_st(address, status);
        }
    }

    pub(super) fn restart_discovery(&mut self, id: ClcbId) {
        if let Some(clcb) = self.clcbs.get_mut(&id) {
            clcb.status = GattStatus::Cancel;
            clcb.auto_update = AutoUpdate::DiscoveryWaiting;
        }
    }

    pub(super) fn discovery_complete(&mut self, id: ClcbId) {
        let Some(clcb) = self.clcbs.get_mut(&id) else {
            return;
        };
        if clcb.auto_update == AutoUpdate::DiscoveryWaiting {
            clcb.auto_update = AutoUpdate::RequestWaiting;
            self.sm_execute(id, ClcbEvent::IntDiscover);
        } else if let Some(pending) = clcb.pending.take() {
            self.sm_execute(id, pending.into_event());
        }
    }

    /// Live discovery ended, successfully or not
    pub(super) fn discovery_done(&mut self, id: ClcbId, status: GattStatus) {
        let Some(clcb) = self.clcbs.get_mut(&id) else {
            return;
        };
        clcb.status = status;
        let (address, conn_id) = (clcb.address, clcb.conn_id);
        match conn_id {
            Some(conn_id) if status.is_success() && self.flags.persist_server_cache => {
                let record = self.record_mut(address);
                record.state = ServerCacheState::Saving;
                record.attr_index = 0;
                self.cache_store.open(address, conn_id, true);
            }
            _ => self.reset_discover_st(address, status),
        }
    }

    /// Reserve the pending slot. A full slot fails the operation with Busy.
    fn enqueue(&mut self, id: ClcbId, op: PendingOperation) -> bool {
        let Some(clcb) = self.clcbs.get_mut(&id) else {
            return false;
        };
        if clcb.pending.is_none() {
            clcb.pending = Some(op);
            return true;
        }
        warn!("clcb {id:?} already has a pending operation");
        let client_if = clcb.client_if;
        if let Some(event) =
            clcb.conn_id.and_then(|conn_id| op.failure_event(conn_id, GattStatus::Busy))
        {
            self.send_event(client_if, event);
        }
        false
    }

    fn connection_of(&self, id: ClcbId) -> Option<ConnectionId> {
        self.clcbs.get(&id).and_then(|clcb| clcb.conn_id)
    }

    fn resolve_handle(&self, id: ClcbId, attr: &AttributeId) -> Option<AttHandle> {
        let clcb = self.clcbs.get(&id)?;
        self.servers.get(&clcb.address)?.cache()?.resolve(attr)
    }

    /// Complete the pending operation without the transport
    fn complete_locally(&mut self, id: ClcbId, op: GattOpType, status: GattStatus) {
        self.sm_execute(
            id,
            ClcbEvent::OperationComplete(OperationCompletion { op, status, payload: None }),
        );
    }

    pub(super) fn read_action(&mut self, id: ClcbId, req: ReadRequest) {
        let (attr, auth_req) = (req.id, req.auth_req);
        if !self.enqueue(id, PendingOperation::Read(req)) {
            return;
        }
        let Some(conn_id) = self.connection_of(id) else {
            return;
        };
        let status = match self.resolve_handle(id, &attr) {
            Some(handle) => self.transport.read(conn_id, ReadParams::ByHandle { handle, auth_req }),
            None => {
                error!("cannot read unknown attribute {attr:?}");
                GattStatus::InternalError
            }
        };
        if !status.is_success() {
            self.complete_locally(id, GattOpType::Read, status);
        }
    }

    pub(super) fn read_multiple_action(&mut self, id: ClcbId, req: ReadMultipleRequest) {
        let handles: Option<Vec<AttHandle>> =
            req.ids.iter().map(|attr| self.resolve_handle(id, attr)).collect();
        let auth_req = req.auth_req;
        if !self.enqueue(id, PendingOperation::ReadMultiple(req)) {
            return;
        }
        let Some(conn_id) = self.connection_of(id) else {
            return;
        };
        let status = match handles {
            Some(handles) => {
                self.transport.read(conn_id, ReadParams::Multiple { handles, auth_req })
            }
            None => {
                error!("read multiple contains an unknown attribute");
                GattStatus::InternalError
            }
        };
        if !status.is_success() {
            self.complete_locally(id, GattOpType::Read, status);
        }
    }

    pub(super) fn write_action(&mut self, id: ClcbId, req: WriteRequest) {
        let handle = self.resolve_handle(id, &req.id);
        let offset = match req.write_type {
            GattWriteType::Request(GattWriteRequestType::Prepare { offset }) => offset,
            _ => 0,
        };
        let (write_type, value, auth_req) = (req.write_type, req.value.clone(), req.auth_req);
        if !self.enqueue(id, PendingOperation::Write(req)) {
            return;
        }
        let Some(conn_id) = self.connection_of(id) else {
            return;
        };
        let status = match handle {
            Some(handle) => self
                .transport
                .write(conn_id, write_type, AttValue { handle, offset, value, auth_req }),
            None => {
                error!("cannot write unknown attribute");
                GattStatus::InternalError
            }
        };
        if !status.is_success() {
            self.complete_locally(id, GattOpType::Write, status);
        }
    }

    pub(super) fn execute_write_action(&mut self, id: ClcbId, req: ExecuteWriteRequest) {
        let is_execute = req.is_execute;
        if !self.enqueue(id, PendingOperation::ExecuteWrite(req)) {
            return;
        }
        let Some(conn_id) = self.connection_of(id) else {
            return;
        };
        let status = self.transport.execute_write(conn_id, is_execute);
        if !status.is_success() {
            self.complete_locally(id, GattOpType::ExecuteWrite, status);
        }
    }

    pub(super) fn confirm_action(&mut self, id: ClcbId, req: ConfirmRequest) {
        let Some(conn_id) = self.connection_of(id) else {
            return;
        };
        let Some(handle) = self.resolve_handle(id, &AttributeId::characteristic(req.characteristic))
        else {
            error!("cannot confirm unknown characteristic {:?}", req.characteristic);
            return;
        };
        let status = self.transport.send_handle_value_confirm(conn_id, handle);
        if !status.is_success() {
            error!("failed to confirm indication on {handle:?}: {status:?}");
        }
    }

    pub(super) fn search_action(&mut self, id: ClcbId, req: SearchRequest) {
        let Some(clcb) = self.clcbs.get(&id) else {
            return;
        };
        let (client_if, Some(conn_id)) = (clcb.client_if, clcb.conn_id) else {
            return;
        };
        let cache = self.servers.get(&clcb.address).and_then(|record| record.cache());
        let services = cache.map(|cache| {
            cache
                .services()
                .iter()
                .map(|service| service.id)
                .filter(|service| req.service_uuid.map_or(true, |uuid| service.id.uuid == uuid))
                .collect::<Vec<_>>()
        });
        let status = match services {
            Some(services) => {
                for service in services {
                    self.send_event(client_if, GattClientEvent::SearchResult { conn_id, service });
                }
                GattStatus::Success
            }
            None => GattStatus::InternalError,
        };
        self.send_event(client_if, GattClientEvent::SearchComplete { conn_id, status });
    }

    pub(super) fn queue_command(&mut self, id: ClcbId, event: ClcbEvent) {
        match PendingOperation::try_from(event) {
            Ok(op) => {
                if self.enqueue(id, op) {
                    debug!("clcb {id:?}: operation queued behind discovery");
                }
            }
            Err(event) => warn!("clcb {id:?}: cannot queue {event:?}"),
        }
    }

    pub(super) fn fail_action(&mut self, id: ClcbId, event: ClcbEvent) {
        let Some(clcb) = self.clcbs.get(&id) else {
            return;
        };
        error!("clcb {id:?}: operation rejected in {:?}", clcb.state);
        let (client_if, conn_id) = (clcb.client_if, clcb.conn_id);
        let failure = PendingOperation::try_from(event)
            .ok()
            .zip(conn_id)
            .and_then(|(op, conn_id)| op.failure_event(conn_id, GattStatus::Error));
        if let Some(failure) = failure {
            self.send_event(client_if, failure);
        }
    }

    pub(super) fn operation_complete(&mut self, id: ClcbId, completion: OperationCompletion) {
        let Some(clcb) = self.clcbs.get_mut(&id) else {
            return;
        };
        let Some(pending) = clcb.pending.as_ref() else {
            error!("clcb {id:?}: {:?} completion with nothing pending", completion.op);
            return;
        };
        if pending.op_type() != Some(completion.op) {
            error!("clcb {id:?}: {:?} completion does not match {pending:?}", completion.op);
            return;
        }
        if clcb.auto_update == AutoUpdate::DiscoveryWaiting {
            // the response may be stale; the operation is replayed after discovery
            clcb.auto_update = AutoUpdate::RequestWaiting;
            self.sm_execute(id, ClcbEvent::IntDiscover);
            return;
        }

        let (client_if, address) = (clcb.client_if, clcb.address);
        let (Some(conn_id), Some(pending)) = (clcb.conn_id, clcb.pending.take()) else {
            return;
        };
        clcb.status = completion.status;
        let cache = self.servers.get(&address).and_then(|record| record.cache());
        let OperationCompletion { status, payload, .. } = completion;

        let event = match pending {
            PendingOperation::Read(req) => {
                let resolved = match payload {
                    Some(OperationPayload::AttributeValue { handle, value })
                        if status.is_success() =>
                    {
                        Some((handle, value))
                    }
                    _ => None,
                };
                let (status, target, value) = match resolved {
                    Some((handle, value)) => {
                        match cache.and_then(|cache| cache.handle_to_id(handle)) {
                            Some(id) => (status, ReadTarget::Attribute(id), value),
                            None => {
                                error!("read response for unknown {handle:?}");
                                (GattStatus::InternalError, ReadTarget::Attribute(req.id), vec![])
                            }
                        }
                    }
                    None => (status, ReadTarget::Attribute(req.id), vec![]),
                };
                GattClientEvent::Read(ReadResult { conn_id, status, target, value })
            }
            PendingOperation::ReadMultiple(req) => {
                let value = match payload {
                    Some(OperationPayload::AttributeValue { value, .. }) if status.is_success() => {
                        value
                    }
                    _ => vec![],
                };
                GattClientEvent::Read(ReadResult {
                    conn_id,
                    status,
                    target: ReadTarget::Multiple(req.ids),
                    value,
                })
            }
            PendingOperation::Write(req) => {
                let id = match payload {
                    Some(OperationPayload::Handle(handle)) => {
                        cache.and_then(|cache| cache.handle_to_id(handle)).unwrap_or(req.id)
                    }
                    _ => req.id,
                };
                GattClientEvent::Write(WriteResult {
                    conn_id,
                    status,
                    id,
                    write_type: req.write_type,
                })
            }
            PendingOperation::ExecuteWrite(_) => GattClientEvent::ExecuteWrite { conn_id, status },
            PendingOperation::Confirm(_) | PendingOperation::Search(_) => return,
        };
        self.send_event(client_if, event);
    }

    pub(super) fn cache_open(&mut self, id: ClcbId) {
        let Some(clcb) = self.clcbs.get(&id) else {
            return;
        };
        let (address, Some(conn_id)) = (clcb.address, clcb.conn_id) else {
            return;
        };
        self.set_discover_st(address);
        if !self.flags.persist_server_cache {
            self.record_mut(address).state = ServerCacheState::PendingDiscovery;
            self.start_discovery(id);
            return;
        }
        let record = self.record_mut(address);
        record.owner = Some(conn_id);
        record.attr_index = 0;
        debug!("loading {address} from storage");
        self.cache_store.open(address, conn_id, false);
    }

    pub(super) fn cache_opened(&mut self, id: ClcbId, status: GattStatus) {
        let Some((address, conn_id, state)) = self.owned_build(id) else {
            warn!("clcb {id:?}: cache open completion without a build");
            return;
        };
        match state {
            ServerCacheState::Loading if status.is_success() => {
                self.cache_store.load(address, conn_id, 0);
            }
            ServerCacheState::Loading => {
                info!("no stored attribute table for {address}, discovering");
                self.record_mut(address).state = ServerCacheState::PendingDiscovery;
                self.start_discovery(id);
            }
            ServerCacheState::Saving if status.is_success() => {
                if !self.save_next_chunk(address, conn_id) {
                    self.finish_save(id, true);
                }
            }
            ServerCacheState::Saving => {
                error!("cannot open storage to save {address}: {status:?}");
                self.finish_save(id, false);
            }
            state => warn!("cache open completion while {state:?}"),
        }
    }

    pub(super) fn cache_loaded(
        &mut self,
        id: ClcbId,
        status: CacheLoadStatus,
        entries: Vec<CacheEntry>,
    ) {
        let Some((address, conn_id, ServerCacheState::Loading)) = self.owned_build(id) else {
            warn!("clcb {id:?}: cache load completion without a load");
            return;
        };
        match status {
            CacheLoadStatus::Complete | CacheLoadStatus::More if !entries.is_empty() => {
                let record = self.record_mut(address);
                record.append_snapshot(&entries);
                if status == CacheLoadStatus::More {
                    let next = record.attr_index;
                    self.cache_store.load(address, conn_id, next);
                } else {
                    info!("loaded attribute table of {address} from storage");
                    self.cache_store.close(address, conn_id);
                    self.reset_discover_st(address, GattStatus::Success);
                }
            }
            _ => {
                warn!("stored attribute table of {address} unusable ({status:?}), discovering");
                self.cache_store.close(address, conn_id);
                let record = self.record_mut(address);
                record.invalidate();
                record.state = ServerCacheState::PendingDiscovery;
                self.start_discovery(id);
            }
        }
    }

    pub(super) fn cache_saved(&mut self, id: ClcbId, status: GattStatus) {
        let Some((address, conn_id, ServerCacheState::Saving)) = self.owned_build(id) else {
            warn!("clcb {id:?}: cache save completion without a save");
            return;
        };
        if !status.is_success() {
            error!("failed to save attribute table of {address}: {status:?}");
            self.finish_save(id, false);
        } else if !self.save_next_chunk(address, conn_id) {
            self.finish_save(id, true);
        }
    }

    fn save_next_chunk(&mut self, address: AddressWithType, conn_id: ConnectionId) -> bool {
        let chunk_size = self.flags.cache_chunk_size;
        match self.record_mut(address).next_save_chunk(chunk_size) {
            Some((start_index, entries)) => {
                self.cache_store.save(address, conn_id, start_index, entries);
                true
            }
            None => false,
        }
    }

    fn finish_save(&mut self, id: ClcbId, saved: bool) {
        let Some((address, conn_id, _)) = self.owned_build(id) else {
            return;
        };
        if !saved {
            self.cache_store.reset(address);
        }
        self.cache_store.close(address, conn_id);
        let status = self.clcbs.get(&id).map(|clcb| clcb.status).unwrap_or(GattStatus::Success);
        self.reset_discover_st(address, status);
    }

    /// The record build this CLCB drives, if any
    fn owned_build(&self, id: ClcbId) -> Option<(AddressWithType, ConnectionId, ServerCacheState)> {
        let clcb = self.clcbs.get(&id)?;
        let conn_id = clcb.conn_id?;
        let record = self.servers.get(&clcb.address)?;
        (record.owner == Some(conn_id) && record.state != ServerCacheState::Idle)
            .then_some((clcb.address, conn_id, record.state))
    }
}

#[cfg(test)]
mod test {
    use crate::{
        core::address::AddressType,
        gatt::{
            channel::{AuthRequirement, DiscoveryRequest},
            mocks::{mock_cache_store::MockCacheStoreEvent, mock_transport::MockTransportEvent},
            status::GattClientError,
        },
    };

    use super::super::test_utils::*;
    use super::*;

    const ADDRESS: AddressWithType = AddressWithType::new([1, 2, 3, 4, 5, 6], AddressType::Public);

    fn read_location(harness: &mut Harness, conn_id: ConnectionId) -> Result<(), GattClientError> {
        harness.module.read(
            conn_id,
            AttributeId::characteristic(BODY_SENSOR_LOCATION),
            AuthRequirement::None,
        )
    }

    #[test]
    fn test_read_resolves_handle_and_reports_value() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        let conn_id = harness.connect_with_cache(client_if, ADDRESS);
        drain(&mut events);
        drain(&mut harness.transport_rx);

        // act
        read_location(&mut harness, conn_id).unwrap();
        harness.module.on_operation_complete(
            conn_id,
            GattOpType::Read,
            GattStatus::Success,
            Some(OperationPayload::AttributeValue {
                handle: BODY_SENSOR_LOCATION_HANDLE,
                value: vec![1],
            }),
        );

        // assert
        assert_eq!(
            harness.transport_rx.try_recv().unwrap(),
            MockTransportEvent::Read(
                conn_id,
                ReadParams::ByHandle {
                    handle: BODY_SENSOR_LOCATION_HANDLE,
                    auth_req: AuthRequirement::None
                }
            )
        );
        assert_eq!(
            events.try_recv().unwrap(),
            GattClientEvent::Read(ReadResult {
                conn_id,
                status: GattStatus::Success,
                target: ReadTarget::Attribute(AttributeId::characteristic(BODY_SENSOR_LOCATION)),
                value: vec![1],
            })
        );
        assert!(!harness.module.has_pending_operation(conn_id));
    }

    #[test]
    fn test_second_operation_is_busy() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        let conn_id = harness.connect_with_cache(client_if, ADDRESS);
        read_location(&mut harness, conn_id).unwrap();
        drain(&mut events);

        // act
        harness.module.execute_write(conn_id, true).unwrap();

        // assert
        assert_eq!(
            events.try_recv().unwrap(),
            GattClientEvent::ExecuteWrite { conn_id, status: GattStatus::Busy }
        );
        assert!(harness.module.has_pending_operation(conn_id));
    }

    #[test]
    fn test_unknown_attribute_is_internal_error() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        let conn_id = harness.connect_with_cache(client_if, ADDRESS);
        drain(&mut events);
        let missing = AttributeId::descriptor(BODY_SENSOR_LOCATION, CCC_ID);

        // act
        harness.module.read(conn_id, missing, AuthRequirement::None).unwrap();

        // assert
        assert_eq!(
            events.try_recv().unwrap(),
            GattClientEvent::Read(ReadResult {
                conn_id,
                status: GattStatus::InternalError,
                target: ReadTarget::Attribute(missing),
                value: vec![],
            })
        );
        assert!(!harness.module.has_pending_operation(conn_id));
    }

    #[test]
    fn test_transport_failure_completes_write() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        let conn_id = harness.connect_with_cache(client_if, ADDRESS);
        drain(&mut events);
        harness.transport.set_operation_status(GattStatus::Error);
        let write_type = GattWriteType::Request(GattWriteRequestType::Request);

        // act
        harness
            .module
            .write(
                conn_id,
                AttributeId::descriptor(MEASUREMENT, CCC_ID),
                write_type,
                vec![1, 0],
                AuthRequirement::None,
            )
            .unwrap();

        // assert
        assert_eq!(
            events.try_recv().unwrap(),
            GattClientEvent::Write(WriteResult {
                conn_id,
                status: GattStatus::Error,
                id: AttributeId::descriptor(MEASUREMENT, CCC_ID),
                write_type,
            })
        );
    }

    #[test]
    fn test_operation_queued_during_discovery_runs_after() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        harness.transport.add_link(ADDRESS);
        harness.module.open(client_if, ADDRESS, true).unwrap();
        let conn_id = harness.conn_id(client_if, ADDRESS);

        // act
        read_location(&mut harness, conn_id).unwrap();
        let queued_state = harness.module.connection_state(conn_id);
        let issued = harness.serve_discovery();

        // assert
        assert_eq!(queued_state, Some(ClcbState::Discovering));
        assert!(issued.iter().any(|event| matches!(event, MockTransportEvent::Read(..))));
        assert_eq!(harness.module.connection_state(conn_id), Some(ClcbState::Connected));
        assert!(harness.module.has_pending_operation(conn_id));
        assert!(matches!(
            drain(&mut events).as_slice(),
            [GattClientEvent::Open { status: GattStatus::Success, .. }]
        ));
    }

    #[test]
    fn test_write_queued_during_discovery_completes_after() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        harness.transport.add_link(ADDRESS);
        harness.module.open(client_if, ADDRESS, true).unwrap();
        let conn_id = harness.conn_id(client_if, ADDRESS);
        let write_type = GattWriteType::Request(GattWriteRequestType::Request);
        harness
            .module
            .write(
                conn_id,
                AttributeId::descriptor(MEASUREMENT, CCC_ID),
                write_type,
                vec![1, 0],
                AuthRequirement::None,
            )
            .unwrap();
        let issued = harness.serve_discovery();
        drain(&mut events);

        // act
        harness.module.on_operation_complete(
            conn_id,
            GattOpType::Write,
            GattStatus::Success,
            Some(OperationPayload::Handle(MEASUREMENT_CCC_HANDLE)),
        );

        // assert
        let writes: Vec<_> = issued
            .iter()
            .filter(|event| matches!(event, MockTransportEvent::Write(..)))
            .collect();
        assert_eq!(writes.len(), 1);
        assert!(matches!(
            writes[0],
            MockTransportEvent::Write(id, issued_type, value)
                if *id == conn_id
                    && *issued_type == write_type
                    && value.handle == MEASUREMENT_CCC_HANDLE
        ));
        assert_eq!(
            drain(&mut events),
            vec![GattClientEvent::Write(WriteResult {
                conn_id,
                status: GattStatus::Success,
                id: AttributeId::descriptor(MEASUREMENT, CCC_ID),
                write_type,
            })]
        );
        assert!(!harness.module.has_pending_operation(conn_id));
    }

    #[test]
    fn test_stale_response_replayed_after_rediscovery() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        let conn_id = harness.connect_with_cache(client_if, ADDRESS);
        read_location(&mut harness, conn_id).unwrap();
        harness.peer.indicate_service_changed(&mut harness.module, conn_id);
        drain(&mut events);
        drain(&mut harness.transport_rx);

        // act
        harness.module.on_operation_complete(
            conn_id,
            GattOpType::Read,
            GattStatus::Success,
            Some(OperationPayload::AttributeValue {
                handle: BODY_SENSOR_LOCATION_HANDLE,
                value: vec![9],
            }),
        );
        let issued = harness.serve_discovery();

        // assert
        assert!(events.try_recv().is_err());
        assert!(matches!(issued.first(), Some(MockTransportEvent::Read(..))));
        assert!(harness.module.has_pending_operation(conn_id));
    }

    #[test]
    fn test_mismatched_completion_is_dropped() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        let conn_id = harness.connect_with_cache(client_if, ADDRESS);
        read_location(&mut harness, conn_id).unwrap();
        drain(&mut events);

        // act
        harness.module.on_operation_complete(conn_id, GattOpType::Write, GattStatus::Success, None);

        // assert
        assert!(events.try_recv().is_err());
        assert!(harness.module.has_pending_operation(conn_id));
    }

    #[test]
    fn test_close_reports_once() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        let conn_id = harness.connect_with_cache(client_if, ADDRESS);
        drain(&mut events);

        // act
        let first = harness.module.close(conn_id);
        let second = harness.module.close(conn_id);

        // assert
        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(GattClientError::UnknownConnection(conn_id)));
        assert_eq!(
            drain(&mut events),
            vec![GattClientEvent::Close {
                status: GattStatus::Success,
                client_if,
                address: ADDRESS,
                conn_id: Some(conn_id),
                reason: DisconnectReason::TERMINATE_LOCAL_HOST,
            }]
        );
    }

    #[test]
    fn test_search_filters_by_uuid() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        let conn_id = harness.connect_with_cache(client_if, ADDRESS);
        drain(&mut events);

        // act
        harness.module.search(conn_id, Some(HEART_RATE_SERVICE.id.uuid)).unwrap();

        // assert
        assert_eq!(
            drain(&mut events),
            vec![
                GattClientEvent::SearchResult { conn_id, service: HEART_RATE_SERVICE },
                GattClientEvent::SearchComplete { conn_id, status: GattStatus::Success },
            ]
        );
    }

    #[test]
    fn test_open_fail_releases_clcb() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        harness.transport.set_connect_result(false);

        // act
        harness.module.open(client_if, ADDRESS, true).unwrap();

        // assert
        assert_eq!(
            events.try_recv().unwrap(),
            GattClientEvent::Open {
                status: GattStatus::Error,
                client_if,
                address: ADDRESS,
                conn_id: None
            }
        );
        assert_eq!(harness.module.server_record(ADDRESS).map(|record| record.num_clcb), Some(0));
    }

    #[test]
    fn test_cancel_direct_open() {
        // arrange
        let mut harness = Harness::new();
        let (client_if, mut events) = harness.register_app();
        harness.module.open(client_if, ADDRESS, true).unwrap();

        // act
        harness.module.cancel_open(client_if, ADDRESS, true).unwrap();
        harness.module.cancel_open(client_if, ADDRESS, true).unwrap();

        // assert
        assert_eq!(
            drain(&mut events),
            vec![
                GattClientEvent::CancelOpen { status: GattStatus::Success, client_if },
                GattClientEvent::CancelOpen { status: GattStatus::Error, client_if },
            ]
        );
    }

    #[test]
    fn test_clcb_pool_exhausted() {
        // arrange
        let mut harness = Harness::with_flags(vec!["INIT_max_clcb=1"]);
        let (client_if, mut events) = harness.register_app();
        let other = AddressWithType::new([6, 5, 4, 3, 2, 1], AddressType::Random);
        harness.module.open(client_if, ADDRESS, true).unwrap();

        // act
        let result = harness.module.open(client_if, other, true);

        // assert
        assert_eq!(result, Err(GattClientError::NoResources));
        assert_eq!(
            events.try_recv().unwrap(),
            GattClientEvent::Open {
                status: GattStatus::NoResources,
                client_if,
                address: other,
                conn_id: None
            }
        );
    }

    #[test]
    fn test_load_from_storage_skips_discovery() {
        // arrange
        let mut harness = Harness::with_flags(vec!["INIT_persist_server_cache=true"]);
        let (client_if, _events) = harness.register_app();
        let entries = harness.expected_snapshot();
        harness.transport.add_link(ADDRESS);
        harness.module.open(client_if, ADDRESS, true).unwrap();
        let conn_id = harness.conn_id(client_if, ADDRESS);

        // act
        harness.module.on_cache_open(ADDRESS, conn_id, GattStatus::Success);
        let (first, rest) = entries.split_at(4);
        harness.module.on_cache_load(ADDRESS, conn_id, CacheLoadStatus::More, first.to_vec());
        harness.module.on_cache_load(ADDRESS, conn_id, CacheLoadStatus::Complete, rest.to_vec());

        // assert
        assert_eq!(
            drain(&mut harness.cache_rx),
            vec![
                MockCacheStoreEvent::Open { address: ADDRESS, conn_id, for_write: false },
                MockCacheStoreEvent::Load { address: ADDRESS, conn_id, start_index: 0 },
                MockCacheStoreEvent::Load { address: ADDRESS, conn_id, start_index: 4 },
                MockCacheStoreEvent::Close { address: ADDRESS, conn_id },
            ]
        );
        assert!(!drain(&mut harness.transport_rx)
            .iter()
            .any(|event| matches!(event, MockTransportEvent::Discover(..))));
        assert_eq!(harness.module.connection_state(conn_id), Some(ClcbState::Connected));
        assert_eq!(
            harness
                .module
                .server_record(ADDRESS)
                .and_then(|record| record.cache())
                .map(|cache| cache.to_entries()),
            Some(entries)
        );
    }

    #[test]
    fn test_discovery_saved_in_chunks() {
        // arrange
        let mut harness = Harness::with_flags(vec![
            "INIT_persist_server_cache=true",
            "INIT_cache_chunk_size=8",
        ]);
        let (client_if, _events) = harness.register_app();
        harness.transport.add_link(ADDRESS);
        harness.module.open(client_if, ADDRESS, true).unwrap();
        let conn_id = harness.conn_id(client_if, ADDRESS);
        harness.module.on_cache_open(ADDRESS, conn_id, GattStatus::Error);
        harness.serve_discovery();
        drain(&mut harness.cache_rx);

        // act
        harness.module.on_cache_open(ADDRESS, conn_id, GattStatus::Success);
        harness.module.on_cache_save(ADDRESS, conn_id, GattStatus::Success);
        harness.module.on_cache_save(ADDRESS, conn_id, GattStatus::Success);

        // assert
        let events = drain(&mut harness.cache_rx);
        let saved: Vec<CacheEntry> = events
            .iter()
            .filter_map(|event| match event {
                MockCacheStoreEvent::Save { entries, .. } => Some(entries.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(saved, harness.expected_snapshot());
        assert_eq!(events.last(), Some(&MockCacheStoreEvent::Close { address: ADDRESS, conn_id }));
        assert_eq!(harness.module.connection_state(conn_id), Some(ClcbState::Connected));
    }

    #[test]
    fn test_save_failure_keeps_table_and_resets_storage() {
        // arrange
        let mut harness = Harness::with_flags(vec!["INIT_persist_server_cache=true"]);
        let (client_if, _events) = harness.register_app();
        harness.transport.add_link(ADDRESS);
        harness.module.open(client_if, ADDRESS, true).unwrap();
        let conn_id = harness.conn_id(client_if, ADDRESS);
        harness.module.on_cache_open(ADDRESS, conn_id, GattStatus::Error);
        harness.serve_discovery();
        drain(&mut harness.cache_rx);

        // act
        harness.module.on_cache_open(ADDRESS, conn_id, GattStatus::Success);
        harness.module.on_cache_save(ADDRESS, conn_id, GattStatus::Error);

        // assert
        let events = drain(&mut harness.cache_rx);
        assert!(events.contains(&MockCacheStoreEvent::Reset(ADDRESS)));
        assert!(harness.module.server_record(ADDRESS).and_then(|record| record.cache()).is_some());
        assert_eq!(harness.module.connection_state(conn_id), Some(ClcbState::Connected));
    }

    #[test]
    fn test_closing_owner_cancels_discovery_for_others() {
        // arrange
        let mut harness = Harness::new();
        let (first, _first_events) = harness.register_app();
        let (second, _second_events) = harness.register_app();
        harness.transport.add_link(ADDRESS);
        harness.module.open(first, ADDRESS, true).unwrap();
        harness.module.open(second, ADDRESS, true).unwrap();
        let owner = harness.conn_id(first, ADDRESS);
        let passive = harness.conn_id(second, ADDRESS);
        let passive_state = harness.module.connection_state(passive);

        // act
        harness.module.close(owner).unwrap();

        // assert
        assert_eq!(passive_state, Some(ClcbState::Discovering));
        assert_eq!(harness.module.connection_state(passive), Some(ClcbState::Connected));
        assert!(harness.module.server_record(ADDRESS).and_then(|record| record.cache()).is_none());
        assert!(drain(&mut harness.transport_rx)
            .contains(&MockTransportEvent::Discover(owner, DiscoveryRequest::PrimaryServices)));
        assert_eq!(
            harness.module.server_record(ADDRESS).map(|record| record.state),
            Some(ServerCacheState::Idle)
        );
    }
}
