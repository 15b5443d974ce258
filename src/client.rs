use crate::calls::{
    CallError, CallSession, CallSnapshot, MediaDevices, MediaFlags, NoMediaDevices,
    NoPeerConnections, PeerConnectionFactory, SignalRelay,
};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::ClientError;
use crate::http::{HttpClient, UreqHttpClient};
use crate::presence::PresenceTracker;
use crate::transport::{TokioWebSocketTransportFactory, TransportFactory};
use crate::upload::{AttachmentUploader, HttpAttachmentUploader, NoUploader};
use anyhow::{Result, anyhow};
use duocore::auth::CredentialProvider;
use duocore::net::{DeliveryError, EventSink};
use duocore::protocol::{InboundEvent, OutboundEvent, RoomMessage};
use duocore::upload::PendingAttachment;
use duocore::{
    Contact, CoreEventBus, Event, EventHandler, Message, MessageContent, RoomId, RoomRegistry,
    SendError, UserId,
};
use log::{debug, info, warn};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, Notify, mpsc};

/// The session engine: one relay connection, the room cache, presence and
/// the single call, driven by one sequential event loop.
pub struct Client {
    self_id: UserId,
    connection: Arc<ConnectionManager>,
    rooms: RwLock<RoomRegistry>,
    presence: Arc<PresenceTracker>,
    calls: Arc<CallSession>,
    uploader: Arc<dyn AttachmentUploader>,
    event_bus: CoreEventBus,
    inbound: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    shutdown_notifier: Notify,
}

impl Client {
    pub fn builder(self_id: impl Into<UserId>) -> ClientBuilder {
        ClientBuilder::new(self_id.into())
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn event_bus(&self) -> &CoreEventBus {
        &self.event_bus
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await
    }

    /// Drains the inbound stream, one event at a time, until [`Client::shutdown`].
    pub async fn run(self: &Arc<Self>) {
        let Some(mut inbound) = self.inbound.lock().await.take() else {
            warn!("Client `run` method called while already running.");
            return;
        };
        info!(target: "Client", "Starting event loop...");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    info!(target: "Client", "Shutdown signaled. Exiting event loop.");
                    break;
                }
                event = inbound.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }
        *self.inbound.lock().await = Some(inbound);
        info!(target: "Client", "Event loop has shut down.");
    }

    /// Applies one inbound event. Public so tests and tools can inject
    /// synthetic events.
    pub async fn dispatch(&self, event: InboundEvent) {
        debug!(target: "Client", "<-- {}", event.name());
        match event {
            InboundEvent::Connected => self.on_connected().await,
            InboundEvent::Disconnected => self.presence.clear_online(),
            InboundEvent::ConnectError { reason } => {
                warn!(target: "Client", "Connection attempt failed: {reason}");
            }
            InboundEvent::OnlineUsers(ids) => self.presence.on_presence_snapshot(ids),
            InboundEvent::MessageHistory { room_id, messages } => {
                let count = self.rooms_mut().on_history(room_id.clone(), messages);
                self.event_bus
                    .dispatch(&Event::HistoryLoaded { room_id, count });
            }
            InboundEvent::Message(RoomMessage { room_id, message }) => {
                self.presence.on_message_from(&room_id, &message.sender_id);
                let appended = self
                    .rooms_mut()
                    .on_message_received(room_id.clone(), message.clone());
                if appended {
                    self.event_bus.dispatch(&Event::Message { room_id, message });
                }
            }
            InboundEvent::Typing {
                room_id,
                user_id,
                is_typing,
            } => self.presence.on_typing(room_id, user_id, is_typing),
            signal => match SignalRelay::route(signal) {
                Ok(message) => {
                    let active = self.active_room();
                    if let Err(e) = self.calls.handle_signal(message, active.as_ref()).await {
                        debug!(target: "Client", "Signaling message rejected: {e}");
                    }
                }
                Err(other) => debug!(target: "Client", "Unhandled inbound event '{}'", other.name()),
            },
        }
    }

    async fn on_connected(&self) {
        let Some(room_id) = self.active_room() else {
            return;
        };
        // Anything may have been missed while offline, so always ask for history.
        info!(target: "Client", "Re-joining {room_id} after connect");
        if let Err(e) = self
            .connection
            .send_event(OutboundEvent::JoinRoom {
                room_id,
                history: true,
            })
            .await
        {
            warn!(target: "Client", "Failed to re-join room: {e}");
        }
    }

    fn rooms(&self) -> std::sync::RwLockReadGuard<'_, RoomRegistry> {
        self.rooms.read().expect("RwLock should not be poisoned")
    }

    fn rooms_mut(&self) -> std::sync::RwLockWriteGuard<'_, RoomRegistry> {
        self.rooms.write().expect("RwLock should not be poisoned")
    }

    pub fn active_room(&self) -> Option<RoomId> {
        self.rooms().active_room().cloned()
    }

    pub fn messages(&self, room_id: &RoomId) -> Vec<Message> {
        self.rooms().messages(room_id)
    }

    pub fn display_name(&self, user: &UserId) -> String {
        self.rooms().display_name(user)
    }

    /// Loads the directory used for sender names.
    pub fn set_contacts(&self, contacts: impl IntoIterator<Item = Contact>) {
        self.rooms_mut().set_contacts(contacts);
    }

    pub fn online(&self) -> Vec<UserId> {
        self.presence.online()
    }

    pub fn typing_in(&self, room_id: &RoomId) -> Vec<UserId> {
        self.presence.typing_in(room_id)
    }

    /// Makes `room_id` the active room and asks the relay for its history if
    /// none is cached. Offline joins are replayed on the next connect.
    pub async fn join_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        let needs_history = self.rooms_mut().join_room(room_id.clone());
        self.presence.reset_room(&room_id);

        match self
            .connection
            .send_event(OutboundEvent::JoinRoom {
                room_id,
                history: needs_history,
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(DeliveryError::NotConnected) => {
                debug!(target: "Client", "Joined room while offline; will join on connect");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Opens the two-party room shared with `peer`.
    pub async fn open_conversation(&self, peer: &UserId) -> Result<RoomId, ClientError> {
        let room_id = RoomId::for_participants(&self.self_id, peer);
        self.join_room(room_id.clone()).await?;
        Ok(room_id)
    }

    /// Sends text or one attachment to the active room.
    ///
    /// The target room is fixed when this is called; switching rooms while the
    /// attachment uploads does not redirect the message.
    pub async fn send_message(
        &self,
        text: &str,
        attachment: Option<PendingAttachment>,
    ) -> Result<Message, ClientError> {
        let result = self.send_message_inner(text, attachment).await;
        if let Err(e) = &result
            && let Some(notice) = e.notice()
        {
            self.event_bus.notify_error(notice);
        }
        result
    }

    async fn send_message_inner(
        &self,
        text: &str,
        attachment: Option<PendingAttachment>,
    ) -> Result<Message, ClientError> {
        let room_id = self.active_room().ok_or(SendError::NoActiveRoom)?;
        MessageContent::validate(text, attachment.is_some())?;

        let attachment = match attachment {
            Some(pending) => Some(self.uploader.upload(pending).await?),
            None => None,
        };
        let content = MessageContent::from_parts(text, attachment)?;
        let message = Message::outgoing(self.self_id.clone(), content);

        self.connection
            .send_event(OutboundEvent::Message(RoomMessage {
                room_id: room_id.clone(),
                message: message.clone(),
            }))
            .await?;

        if self
            .rooms_mut()
            .on_message_received(room_id.clone(), message.clone())
        {
            self.event_bus.dispatch(&Event::Message {
                room_id: room_id.clone(),
                message: message.clone(),
            });
        }
        if let Err(e) = self.presence.emit_local_typing(&room_id, false).await {
            debug!(target: "Client", "Could not clear typing state: {e}");
        }
        Ok(message)
    }

    /// Reports a keystroke (`true`) or an explicit stop in the active room.
    pub async fn typing(&self, is_typing: bool) -> Result<(), ClientError> {
        let Some(room_id) = self.active_room() else {
            return Ok(());
        };
        match self.presence.emit_local_typing(&room_id, is_typing).await {
            Ok(()) | Err(DeliveryError::NotConnected) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn start_call(&self, with_video: bool) -> Result<(), ClientError> {
        let Some(room_id) = self.active_room() else {
            let err = CallError::NoActiveRoom;
            if let Some(notice) = err.notice() {
                self.event_bus.notify_error(notice);
            }
            return Err(err.into());
        };
        Ok(self.calls.start_call(room_id, with_video).await?)
    }

    pub async fn answer_call(&self) -> Result<(), ClientError> {
        Ok(self.calls.answer_call().await?)
    }

    pub async fn reject_call(&self) -> Result<(), ClientError> {
        Ok(self.calls.reject_call().await?)
    }

    pub async fn hang_up(&self) {
        self.calls.hang_up().await;
    }

    pub fn toggle_mute(&self) -> MediaFlags {
        self.calls.toggle_mute()
    }

    pub fn toggle_video(&self) -> MediaFlags {
        self.calls.toggle_video()
    }

    pub fn call(&self) -> CallSnapshot {
        self.calls.snapshot()
    }

    /// Hangs up any call, then releases the connection.
    pub async fn disconnect(&self) {
        info!("Disconnecting client intentionally.");
        self.calls.hang_up().await;
        self.connection.disconnect().await;
        self.presence.clear_online();
    }

    /// Disconnects and stops [`Client::run`].
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.shutdown_notifier.notify_one();
    }
}

pub struct ClientBuilder {
    self_id: UserId,
    config: ClientConfig,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    http_client: Option<Arc<dyn HttpClient>>,
    uploader: Option<Arc<dyn AttachmentUploader>>,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    event_bus: CoreEventBus,
}

impl ClientBuilder {
    fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            config: ClientConfig::default(),
            transport_factory: None,
            credentials: None,
            http_client: None,
            uploader: None,
            media: Arc::new(NoMediaDevices),
            peers: Arc::new(NoPeerConnections),
            event_bus: CoreEventBus::new(),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport_factory(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.transport_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_credentials(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.credentials = Some(Arc::new(provider));
        self
    }

    pub fn with_http_client(mut self, client: impl HttpClient + 'static) -> Self {
        self.http_client = Some(Arc::new(client));
        self
    }

    pub fn with_uploader(mut self, uploader: impl AttachmentUploader + 'static) -> Self {
        self.uploader = Some(Arc::new(uploader));
        self
    }

    pub fn with_media_devices(mut self, media: impl MediaDevices + 'static) -> Self {
        self.media = Arc::new(media);
        self
    }

    pub fn with_peer_connections(mut self, peers: impl PeerConnectionFactory + 'static) -> Self {
        self.peers = Arc::new(peers);
        self
    }

    pub fn on_event(self, handler: impl EventHandler + 'static) -> Self {
        self.event_bus.add_handler(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Arc<Client>> {
        let credentials = self
            .credentials
            .ok_or_else(|| anyhow!("A credential provider is required"))?;
        let transport_factory = self.transport_factory.unwrap_or_else(|| {
            Arc::new(TokioWebSocketTransportFactory::new(
                self.config.relay_url.clone(),
            ))
        });
        let uploader: Arc<dyn AttachmentUploader> = match (self.uploader, &self.config.upload_url)
        {
            (Some(uploader), _) => uploader,
            (None, Some(url)) => {
                let http = self
                    .http_client
                    .unwrap_or_else(|| Arc::new(UreqHttpClient::new()));
                Arc::new(HttpAttachmentUploader::new(http, url.clone()))
            }
            (None, None) => Arc::new(NoUploader),
        };

        let (connection, inbound) = ConnectionManager::new(
            transport_factory,
            credentials,
            self.config.reconnect.clone(),
            self.event_bus.clone(),
            self.config.inbound_capacity,
        );
        let sink: Arc<dyn EventSink> = connection.clone();
        let presence = PresenceTracker::new(
            self.self_id.clone(),
            self.config.typing.clone(),
            sink.clone(),
            self.event_bus.clone(),
        );
        let calls = Arc::new(CallSession::new(
            SignalRelay::new(sink),
            self.media,
            self.peers,
            self.event_bus.clone(),
        ));

        info!(target: "Client", "Client for {} built (relay: {})", self.self_id, self.config.relay_url);
        Ok(Arc::new(Client {
            self_id: self.self_id,
            connection,
            rooms: RwLock::new(RoomRegistry::new()),
            presence,
            calls,
            uploader,
            event_bus: self.event_bus,
            inbound: Mutex::new(Some(inbound)),
            shutdown_notifier: Notify::new(),
        }))
    }
}
