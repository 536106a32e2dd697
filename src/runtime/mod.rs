use std::sync::Arc;
use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{ActorRef, Message, RpcReplyPort};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::config::{RemoteStoreConfig, SystemConfig};
use crate::domain::model::{Lobby, Participant, Trip};

pub mod chat_store;
pub mod identity;
pub mod lobby;
pub mod remote_store;
pub mod storage;
pub mod tool_registry;
pub mod trip_store;

pub use chat_store::{ChatError, ChatStoreHandle};
pub use identity::{IdentityError, IdentityProvider};
pub use lobby::{LobbyChanged, LobbyError, LobbyHandle};
pub use remote_store::{InMemoryRemoteStore, RemoteError, RemoteStore};
pub use storage::{create_storage, FileStorage, LocalStorage, MemoryStorage, StorageKey};
pub use tool_registry::{NoopPresenter, Presenter, ToolRegistry, ToolRequest, ToolResponse};
pub use trip_store::{TripError, TripSnapshot, TripStatus, TripStoreHandle};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to start {0}: {1}")]
    Spawn(&'static str, String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Lobby(#[from] LobbyError),
    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}

/// Call an actor and wait for its reply, flattening ractor's call outcomes
/// into a message suitable for an `Actor(String)` error variant.
pub(crate) async fn rpc<M, T>(
    actor: &ActorRef<M>,
    build: impl FnOnce(RpcReplyPort<T>) -> M,
    timeout: Duration,
) -> Result<T, String>
where
    M: Message,
    T: Send + 'static,
{
    match actor.call(build, Some(timeout)).await {
        Ok(CallResult::Success(value)) => Ok(value),
        Ok(CallResult::Timeout) => Err("rpc timeout".into()),
        Ok(CallResult::SenderError) => Err("rpc sender error".into()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Who is planning, where, and which trip is open after startup.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub participant: Participant,
    pub lobby: Lobby,
    pub trip: Option<Trip>,
}

pub struct Runtime {
    config: SystemConfig,
    storage: Arc<dyn LocalStorage>,
    identity: Arc<IdentityProvider>,
    lobby: LobbyHandle,
    trips: TripStoreHandle,
    chat: ChatStoreHandle,
    tools: Arc<ToolRegistry>,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub async fn start(config: SystemConfig) -> Result<Self, RuntimeError> {
        let remote = create_remote_store(&config.remote_store);
        let storage = create_storage(&config.storage);
        Self::start_with(config, remote, storage).await
    }

    /// Start against caller-supplied backends.
    pub async fn start_with(
        config: SystemConfig,
        remote: Arc<dyn RemoteStore>,
        storage: Arc<dyn LocalStorage>,
    ) -> Result<Self, RuntimeError> {
        let timeout = config.call_timeout();
        let identity = Arc::new(IdentityProvider::new(storage.clone()));

        let (lobby, lobby_handle) = lobby::spawn_lobby(
            lobby::LobbyArgs {
                remote: remote.clone(),
                storage: storage.clone(),
                identity: identity.clone(),
                config: config.lobby.clone(),
                invite_codes: None,
            },
            timeout,
        )
        .await
        .map_err(|e| RuntimeError::Spawn("lobby", e.to_string()))?;

        let (trips, trips_handle) = trip_store::spawn_trip_store(
            trip_store::TripStoreArgs {
                remote: remote.clone(),
                identity: identity.clone(),
                lobby: lobby.clone(),
                default_currency: config.trip.default_currency.clone(),
            },
            timeout,
        )
        .await
        .map_err(|e| RuntimeError::Spawn("trip store", e.to_string()))?;

        let (chat, chat_handle) = chat_store::spawn_chat_store(
            chat_store::ChatStoreArgs {
                remote,
                identity: identity.clone(),
                lobby: lobby.clone(),
                window: config.chat.window,
            },
            timeout,
        )
        .await
        .map_err(|e| RuntimeError::Spawn("chat store", e.to_string()))?;

        let tools = Arc::new(ToolRegistry::new(
            trips.clone(),
            Arc::new(NoopPresenter),
            config.tools.idempotency_window,
        ));

        Ok(Runtime {
            config,
            storage,
            identity,
            lobby,
            trips,
            chat,
            tools,
            handles: vec![lobby_handle, trips_handle, chat_handle],
        })
    }

    /// Replace the presenter used by INTERRUPT tools.
    pub fn with_presenter(mut self, presenter: Arc<dyn Presenter>) -> Self {
        self.tools = Arc::new(ToolRegistry::new(
            self.trips.clone(),
            presenter,
            self.config.tools.idempotency_window,
        ));
        self
    }

    /// Resolve identity, then resume the saved lobby or create a fresh one,
    /// then resume the saved trip if it belongs to that lobby.
    ///
    /// Only identity and lobby failures are fatal; a trip that can no longer
    /// be loaded is forgotten.
    #[tracing::instrument(skip_all)]
    pub async fn initialize_session(&self) -> Result<SessionContext, RuntimeError> {
        let participant = self.identity.get_or_create()?;

        let saved_lobby = self
            .storage
            .get(StorageKey::CurrentLobbyId)?
            .and_then(|id| id.parse::<Uuid>().ok());
        let resumed = match saved_lobby {
            Some(lobby_id) => match self.lobby.load_lobby(lobby_id).await {
                Ok(lobby) => Some(lobby),
                Err(error) => {
                    warn!(%lobby_id, %error, "saved lobby unavailable; starting a new one");
                    None
                }
            },
            None => None,
        };
        let lobby = match resumed {
            Some(lobby) => lobby,
            None => {
                self.lobby
                    .create_lobby(&self.config.lobby.default_name, None)
                    .await?
            }
        };

        let trip = self.resume_trip(&lobby).await;
        info!(
            participant = %participant.id,
            lobby_id = %lobby.id,
            invite_code = %lobby.invite_code,
            trip = ?trip.as_ref().map(|t| t.id),
            "session ready"
        );
        Ok(SessionContext {
            participant,
            lobby,
            trip,
        })
    }

    async fn resume_trip(&self, lobby: &Lobby) -> Option<Trip> {
        let saved = match self.lobby.current_trip_id().await {
            Ok(saved) => saved?,
            Err(error) => {
                warn!(%error, "could not read saved trip");
                return None;
            }
        };
        if let Err(error) = self.trips.load_trip(saved).await {
            warn!(trip_id = %saved, %error, "saved trip unavailable");
            if let Err(error) = self.lobby.set_current_trip(None).await {
                warn!(%error, "could not forget saved trip");
            }
            return None;
        }
        let trip = match self.trips.snapshot().await {
            Ok(snapshot) => snapshot.trip,
            Err(error) => {
                warn!(%error, "could not read trip after resume");
                None
            }
        };
        match trip {
            Some(trip) if trip.lobby_id == lobby.id => Some(trip),
            _ => {
                info!(trip_id = %saved, "saved trip belongs to another lobby; forgetting it");
                if let Err(error) = self.trips.clear_trip().await {
                    warn!(%error, "could not clear foreign trip");
                }
                None
            }
        }
    }

    pub fn identity(&self) -> &Arc<IdentityProvider> {
        &self.identity
    }

    pub fn lobby(&self) -> &LobbyHandle {
        &self.lobby
    }

    pub fn trips(&self) -> &TripStoreHandle {
        &self.trips
    }

    pub fn chat(&self) -> &ChatStoreHandle {
        &self.chat
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub async fn shutdown(self) {
        self.chat.stop();
        self.trips.stop();
        self.lobby.stop();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn create_remote_store(config: &RemoteStoreConfig) -> Arc<dyn RemoteStore> {
    match config {
        RemoteStoreConfig::InMemory => Arc::new(InMemoryRemoteStore::new()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::future::Future;
    use std::time::Duration;

    /// Poll `check` until it holds, failing the test after two seconds.
    pub async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 2s");
    }

    /// Give spawned reloads and feed deliveries time to drain.
    pub async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
