//! One controller connection from accept to close.
//!
//! The connection starts in plaintext for the pairing endpoints. Once
//! pair-verify completes, every later byte in both directions goes through
//! the [`EncryptedChannel`], and `EVENT/1.0` notifications are pushed
//! between responses.

use std::net::SocketAddr;
use std::sync::Arc;

use hap_accessory::RequestContext;
use hap_core::connection::ConnectionId;
use hap_core::error::Error;
use hap_core::status::{HapStatus, HttpStatus};
use hap_pairing::{EncryptedChannel, PairingsEffect, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::events::{ConnectionCommand, EventBuffer};
use crate::http::{HttpRequest, HttpResponse, Method};
use crate::pipeline::{RequestScope, TimedWrite};
use crate::server::Shared;

const READ_CHUNK: usize = 4096;

pub(crate) struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    shared: Arc<Shared>,
    session: Session,
    channel: Option<EncryptedChannel>,
    /// Plaintext received but not yet parsed into a request.
    inbound: Vec<u8>,
    timed_write: Option<TimedWrite>,
    events: EventBuffer,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    closing: bool,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, peer: SocketAddr, shared: Arc<Shared>) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        shared.hub.register(id, tx);
        let session = Session::new(id, Arc::clone(&shared.store), Arc::clone(&shared.policy));
        let events = EventBuffer::new(shared.config.event_coalescing);
        Self {
            id,
            peer,
            shared,
            session,
            channel: None,
            inbound: Vec::new(),
            timed_write: None,
            events,
            commands,
            closing: false,
        }
    }

    pub(crate) async fn run(mut self, stream: TcpStream) {
        info!(connection = %self.id, peer = %self.peer, "Controller connected");
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let deadline = self.events.deadline();
            let result = tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(connection = %self.id, "Connection closed by peer");
                        break;
                    }
                    Ok(n) => self.handle_bytes(&buf[..n], &mut writer).await,
                    Err(e) => Err(e.into()),
                },
                Some(command) = self.commands.recv() => self.handle_command(command, &mut writer).await,
                _ = wait_until(deadline) => self.flush_events(&mut writer).await,
            };

            if let Err(e) = result {
                match e {
                    Error::Connection(e) => debug!(connection = %self.id, error = %e, "Connection error"),
                    e => warn!(connection = %self.id, error = %e, "Closing connection"),
                }
                break;
            }
            if self.closing {
                debug!(connection = %self.id, "Closing connection on request");
                break;
            }
        }

        let _ = writer.shutdown().await;
        self.close();
    }

    async fn handle_bytes(&mut self, data: &[u8], writer: &mut OwnedWriteHalf) -> Result<(), Error> {
        match self.channel.as_mut() {
            Some(channel) => {
                let plaintext = channel.decrypt(data)?;
                self.inbound.extend_from_slice(&plaintext);
            }
            None => self.inbound.extend_from_slice(data),
        }

        while !self.closing {
            let parsed = match HttpRequest::parse(&self.inbound, self.shared.config.max_body_len) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => break,
                Err(e) => {
                    debug!(connection = %self.id, error = %e, "Rejecting malformed request");
                    let response = HttpResponse::new(HttpStatus::BadRequest);
                    self.send(writer, &response.serialize()).await?;
                    self.closing = true;
                    break;
                }
            };
            let (request, consumed) = parsed;
            self.inbound.drain(..consumed);

            trace!(connection = %self.id, method = request.method.as_str(), path = %request.path, "Request");
            let response = self.dispatch(&request).await;
            trace!(connection = %self.id, status = %response.status, "Response");
            self.send(writer, &response.serialize()).await?;

            // M4 goes out in the clear; everything after it is encrypted.
            if let Some(keys) = self.session.take_session_keys() {
                self.channel = Some(EncryptedChannel::new(&keys));
                debug!(connection = %self.id, "Encryption enabled");
            }
        }
        Ok(())
    }

    async fn handle_command(
        &mut self,
        command: ConnectionCommand,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), Error> {
        match command {
            ConnectionCommand::Event(item) => {
                if self.events.push(item) {
                    self.flush_events(writer).await?;
                }
            }
            ConnectionCommand::Close => self.closing = true,
        }
        Ok(())
    }

    async fn flush_events(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), Error> {
        if self.events.is_empty() {
            return Ok(());
        }
        let batch = self.events.take();
        if self.channel.is_none() {
            debug!(connection = %self.id, "Dropping events for unencrypted connection");
            return Ok(());
        }
        debug!(connection = %self.id, count = batch.len(), "Sending events");
        self.send(writer, &HttpResponse::event(batch).serialize()).await
    }

    async fn send(&mut self, writer: &mut OwnedWriteHalf, data: &[u8]) -> Result<(), Error> {
        match self.channel.as_mut() {
            Some(channel) => {
                let frames = channel.encrypt(data)?;
                writer.write_all(&frames).await?;
            }
            None => writer.write_all(data).await?,
        }
        Ok(())
    }

    async fn dispatch(&mut self, request: &HttpRequest) -> HttpResponse {
        let path = request.path.as_str();
        match (request.method, path) {
            (Method::Post, "/identify") => return self.identify(),
            (Method::Post, "/pair-setup") => return self.pair_setup(&request.body).await,
            (Method::Post, "/pair-verify") => return self.pair_verify(&request.body),
            _ => {}
        }

        if !self.session.is_verified() {
            debug!(connection = %self.id, path, "Request before pair-verify");
            return HttpResponse::hap_status(
                HttpStatus::ConnectionAuthorizationRequired,
                HapStatus::InsufficientPrivileges,
            );
        }

        let shared = Arc::clone(&self.shared);
        let scope = self.scope();
        match (request.method, path) {
            (Method::Post, "/pairings") => self.pairings(&request.body).await,
            (Method::Get, "/accessories") => shared.pipeline.accessories(&scope.ctx).await,
            (Method::Get, "/characteristics") => shared.pipeline.get_characteristics(&scope, request).await,
            (Method::Put, "/characteristics") => {
                shared
                    .pipeline
                    .put_characteristics(&scope, &request.body, &mut self.timed_write)
                    .await
            }
            (Method::Put, "/prepare") => shared.pipeline.prepare(&scope, &request.body, &mut self.timed_write),
            (Method::Post, "/resource") => shared.pipeline.resource(&request.body).await,
            (
                _,
                "/identify" | "/pair-setup" | "/pair-verify" | "/pairings" | "/accessories"
                | "/characteristics" | "/prepare" | "/resource",
            ) => HttpResponse::new(HttpStatus::MethodNotAllowed),
            _ => HttpResponse::hap_status(HttpStatus::NotFound, HapStatus::ResourceDoesNotExist),
        }
    }

    fn scope(&self) -> RequestScope {
        RequestScope {
            connection: self.id,
            ctx: RequestContext::remote(
                self.id,
                self.session.controller().unwrap_or_default(),
                self.session.is_admin(),
            ),
        }
    }

    fn identify(&self) -> HttpResponse {
        if !self.session.can_identify() {
            debug!(connection = %self.id, "Identify refused, accessory is paired");
            return HttpResponse::hap_status(HttpStatus::BadRequest, HapStatus::InsufficientPrivileges);
        }
        self.shared.accessory.identify();
        HttpResponse::new(HttpStatus::NoContent)
    }

    async fn pair_setup(&mut self, body: &[u8]) -> HttpResponse {
        let response = self.session.pair_setup(body);
        if let Some(controller) = &response.paired {
            self.shared.on_paired(controller).await;
        }
        HttpResponse::tlv8(response.body)
    }

    fn pair_verify(&mut self, body: &[u8]) -> HttpResponse {
        let body = self.session.pair_verify(body);
        if let Some(controller) = self.session.controller() {
            self.shared.hub.set_controller(self.id, controller);
        }
        HttpResponse::tlv8(body)
    }

    async fn pairings(&mut self, body: &[u8]) -> HttpResponse {
        let Some(response) = self.session.pairings(body) else {
            return HttpResponse::hap_status(
                HttpStatus::ConnectionAuthorizationRequired,
                HapStatus::InsufficientPrivileges,
            );
        };
        match &response.effect {
            PairingsEffect::None => {}
            PairingsEffect::Removed(controllers) => {
                // Our own connection closes after this response goes out.
                self.shared.hub.close_controllers(controllers);
            }
            PairingsEffect::Unpaired(controllers) => {
                info!(connection = %self.id, removed = controllers.len(), "Last admin removed");
                self.shared.hub.close_all_except(Some(self.id));
                self.closing = true;
                self.shared.on_unpaired().await;
            }
        }
        HttpResponse::tlv8(response.body)
    }

    fn close(&mut self) {
        for (aid, iid) in self.shared.hub.unregister(self.id) {
            if let Some(characteristic) = self.shared.accessory.find_characteristic(aid, iid) {
                characteristic.remove_subscriber();
            }
        }
        self.shared.accessory.handle_connection_closed(self.id);
        info!(connection = %self.id, peer = %self.peer, "Controller disconnected");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
