use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef, Message, OutputPort, RpcReplyPort, SpawnErr};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::identity::{IdentityError, IdentityProvider};
use super::remote_store::{decode, decode_all, Query, RemoteError, RemoteStore, Table};
use super::storage::{LocalStorage, StorageError, StorageKey};
use super::rpc;
use crate::domain::config::LobbyConfig;
use crate::domain::identity::{generate_invite_code, normalize_invite_code};
use crate::domain::model::{Lobby, LobbyMember, MemberRole};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    #[error("no active lobby found for invite code {0}")]
    InviteNotFound(String),
    #[error("lobby {0} was not found or is no longer active")]
    NotFound(Uuid),
    #[error("not in a lobby; create or join one first")]
    NoLobby,
    #[error("lobby name must not be blank")]
    BlankName,
    #[error("could not allocate a unique invite code after {0} attempts")]
    CreateFailed(u32),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("lobby actor call failed: {0}")]
    Actor(String),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Broadcast whenever the current lobby is set or cleared.
#[derive(Debug, Clone)]
pub struct LobbyChanged(pub Option<Lobby>);

pub enum LobbyMessage {
    Create {
        name: String,
        description: Option<String>,
        reply: RpcReplyPort<Result<Lobby, LobbyError>>,
    },
    Join {
        invite_code: String,
        reply: RpcReplyPort<Result<Lobby, LobbyError>>,
    },
    Load {
        lobby_id: Uuid,
        reply: RpcReplyPort<Result<Lobby, LobbyError>>,
    },
    Leave(RpcReplyPort<Result<(), LobbyError>>),
    Current(RpcReplyPort<Option<Lobby>>),
    Members(RpcReplyPort<Result<Vec<LobbyMember>, LobbyError>>),
    SetCurrentTrip {
        trip_id: Option<Uuid>,
        reply: RpcReplyPort<Result<(), LobbyError>>,
    },
    CurrentTripId(RpcReplyPort<Result<Option<Uuid>, LobbyError>>),
}

/// Produces candidate invite codes. Replaceable so collisions can be forced.
pub type InviteCodeSource = Box<dyn FnMut() -> String + Send + Sync>;

// ---------------------------------------------------------------------------
// LobbyActor
// ---------------------------------------------------------------------------

pub struct LobbyActor;

pub struct LobbyArgs {
    pub remote: Arc<dyn RemoteStore>,
    pub storage: Arc<dyn LocalStorage>,
    pub identity: Arc<IdentityProvider>,
    pub config: LobbyConfig,
    pub invite_codes: Option<InviteCodeSource>,
}

pub struct LobbyState {
    remote: Arc<dyn RemoteStore>,
    storage: Arc<dyn LocalStorage>,
    identity: Arc<IdentityProvider>,
    config: LobbyConfig,
    invite_codes: InviteCodeSource,
    changes: Arc<OutputPort<LobbyChanged>>,
    current: Option<Lobby>,
}

impl Actor for LobbyActor {
    type Msg = LobbyMessage;
    type State = LobbyState;
    type Arguments = (LobbyArgs, Arc<OutputPort<LobbyChanged>>);

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        (args, changes): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(LobbyState {
            remote: args.remote,
            storage: args.storage,
            identity: args.identity,
            config: args.config,
            invite_codes: args
                .invite_codes
                .unwrap_or_else(|| Box::new(|| generate_invite_code(&mut rand::rng()))),
            changes,
            current: None,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            LobbyMessage::Create {
                name,
                description,
                reply,
            } => {
                let _ = reply.send(create_lobby(state, &name, description).await);
            }
            LobbyMessage::Join { invite_code, reply } => {
                let _ = reply.send(join_lobby(state, &invite_code).await);
            }
            LobbyMessage::Load { lobby_id, reply } => {
                let _ = reply.send(load_lobby(state, lobby_id).await);
            }
            LobbyMessage::Leave(reply) => {
                let result = set_current(state, None);
                if result.is_ok() {
                    info!("left lobby");
                }
                let _ = reply.send(result);
            }
            LobbyMessage::Current(reply) => {
                let _ = reply.send(state.current.clone());
            }
            LobbyMessage::Members(reply) => {
                let _ = reply.send(members(state).await);
            }
            LobbyMessage::SetCurrentTrip { trip_id, reply } => {
                let _ = reply.send(set_current_trip(state, trip_id));
            }
            LobbyMessage::CurrentTripId(reply) => {
                let _ = reply.send(current_trip_id(state));
            }
        }
        Ok(())
    }
}

#[tracing::instrument(skip_all, fields(name = %name))]
async fn create_lobby(
    state: &mut LobbyState,
    name: &str,
    description: Option<String>,
) -> Result<Lobby, LobbyError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(LobbyError::BlankName);
    }
    let participant = state.identity.get_or_create()?;
    let attempts = state.config.invite_code_attempts.max(1);

    for attempt in 1..=attempts {
        let invite_code = (state.invite_codes)();

        let taken = state
            .remote
            .select(
                &Query::new(Table::Lobbies)
                    .eq("invite_code", &invite_code)
                    .eq("is_active", true)
                    .limit(1),
            )
            .await?;
        if !taken.is_empty() {
            debug!(attempt, "invite code already in use");
            continue;
        }

        let row = json!({
            "name": name,
            "description": description,
            "owner_id": participant.id,
            "invite_code": invite_code,
            "is_active": true,
        });
        let lobby: Lobby = match state.remote.insert(Table::Lobbies, row).await {
            Ok(row) => decode(row)?,
            Err(RemoteError::Conflict { .. }) => {
                debug!(attempt, "invite code taken concurrently");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        add_member(state, lobby.id, &participant.id, MemberRole::Owner).await;
        set_current(state, Some(lobby.clone()))?;
        info!(lobby_id = %lobby.id, invite_code = %lobby.invite_code, "created lobby");
        return Ok(lobby);
    }

    Err(LobbyError::CreateFailed(attempts))
}

async fn join_lobby(state: &mut LobbyState, invite_code: &str) -> Result<Lobby, LobbyError> {
    let code = normalize_invite_code(invite_code);
    let rows = state
        .remote
        .select(
            &Query::new(Table::Lobbies)
                .eq("invite_code", &code)
                .eq("is_active", true)
                .limit(1),
        )
        .await?;
    let lobby: Lobby = match rows.into_iter().next() {
        Some(row) => decode(row)?,
        None => return Err(LobbyError::InviteNotFound(code)),
    };

    let participant = state.identity.get_or_create()?;
    add_member(state, lobby.id, &participant.id, MemberRole::Member).await;
    set_current(state, Some(lobby.clone()))?;
    info!(lobby_id = %lobby.id, "joined lobby");
    Ok(lobby)
}

async fn load_lobby(state: &mut LobbyState, lobby_id: Uuid) -> Result<Lobby, LobbyError> {
    let rows = state
        .remote
        .select(&Query::new(Table::Lobbies).eq("id", lobby_id).limit(1))
        .await?;
    let lobby: Lobby = match rows.into_iter().next() {
        Some(row) => decode(row)?,
        None => return Err(LobbyError::NotFound(lobby_id)),
    };
    if !lobby.active {
        return Err(LobbyError::NotFound(lobby_id));
    }
    set_current(state, Some(lobby.clone()))?;
    Ok(lobby)
}

async fn members(state: &LobbyState) -> Result<Vec<LobbyMember>, LobbyError> {
    let lobby = state.current.as_ref().ok_or(LobbyError::NoLobby)?;
    let rows = state
        .remote
        .select(&Query::new(Table::LobbyMembers).eq("lobby_id", lobby.id))
        .await?;
    Ok(decode_all(rows)?)
}

/// Membership rows are informational; a lobby is usable without one.
async fn add_member(state: &LobbyState, lobby_id: Uuid, user_id: &str, role: MemberRole) {
    let existing = state
        .remote
        .select(
            &Query::new(Table::LobbyMembers)
                .eq("lobby_id", lobby_id)
                .eq("user_id", user_id)
                .limit(1),
        )
        .await;
    match existing {
        Ok(rows) if !rows.is_empty() => return,
        Ok(_) => {}
        Err(error) => {
            warn!(%lobby_id, %error, "could not check lobby membership");
            return;
        }
    }

    let member = LobbyMember {
        lobby_id,
        user_id: user_id.to_string(),
        role,
    };
    let row = match serde_json::to_value(&member) {
        Ok(row) => row,
        Err(error) => {
            warn!(%lobby_id, %error, "could not encode lobby membership");
            return;
        }
    };
    if let Err(error) = state.remote.insert(Table::LobbyMembers, row).await {
        warn!(%lobby_id, %error, "could not record lobby membership");
    }
}

/// Persist, then publish. Leaving also forgets the current trip.
fn set_current(state: &mut LobbyState, lobby: Option<Lobby>) -> Result<(), LobbyError> {
    match &lobby {
        Some(lobby) => state
            .storage
            .set(StorageKey::CurrentLobbyId, &lobby.id.to_string())?,
        None => {
            state.storage.remove(StorageKey::CurrentLobbyId)?;
            state.storage.remove(StorageKey::CurrentTripId)?;
        }
    }
    state.current = lobby.clone();
    state.changes.send(LobbyChanged(lobby));
    Ok(())
}

fn set_current_trip(state: &LobbyState, trip_id: Option<Uuid>) -> Result<(), LobbyError> {
    match trip_id {
        Some(trip_id) => state
            .storage
            .set(StorageKey::CurrentTripId, &trip_id.to_string())?,
        None => state.storage.remove(StorageKey::CurrentTripId)?,
    }
    Ok(())
}

/// An unparsable saved id reads as no trip.
fn current_trip_id(state: &LobbyState) -> Result<Option<Uuid>, LobbyError> {
    let saved = state.storage.get(StorageKey::CurrentTripId)?;
    Ok(saved.and_then(|raw| match raw.parse::<Uuid>() {
        Ok(id) => Some(id),
        Err(_) => {
            debug!(%raw, "ignoring malformed saved trip id");
            None
        }
    }))
}

// ---------------------------------------------------------------------------
// LobbyHandle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LobbyHandle {
    actor: ActorRef<LobbyMessage>,
    changes: Arc<OutputPort<LobbyChanged>>,
    timeout: Duration,
}

pub async fn spawn_lobby(
    args: LobbyArgs,
    timeout: Duration,
) -> Result<(LobbyHandle, JoinHandle<()>), SpawnErr> {
    let changes = Arc::new(OutputPort::default());
    let (actor, handle) = Actor::spawn(None, LobbyActor, (args, changes.clone())).await?;
    Ok((
        LobbyHandle {
            actor,
            changes,
            timeout,
        },
        handle,
    ))
}

impl LobbyHandle {
    pub async fn create_lobby(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<Lobby, LobbyError> {
        let name = name.to_string();
        rpc(
            &self.actor,
            |reply| LobbyMessage::Create {
                name,
                description,
                reply,
            },
            self.timeout,
        )
        .await
        .map_err(LobbyError::Actor)?
    }

    pub async fn join_lobby(&self, invite_code: &str) -> Result<Lobby, LobbyError> {
        let invite_code = invite_code.to_string();
        rpc(
            &self.actor,
            |reply| LobbyMessage::Join { invite_code, reply },
            self.timeout,
        )
        .await
        .map_err(LobbyError::Actor)?
    }

    pub async fn load_lobby(&self, lobby_id: Uuid) -> Result<Lobby, LobbyError> {
        rpc(
            &self.actor,
            |reply| LobbyMessage::Load { lobby_id, reply },
            self.timeout,
        )
        .await
        .map_err(LobbyError::Actor)?
    }

    pub async fn leave_lobby(&self) -> Result<(), LobbyError> {
        rpc(&self.actor, LobbyMessage::Leave, self.timeout)
            .await
            .map_err(LobbyError::Actor)?
    }

    pub async fn current_lobby(&self) -> Result<Option<Lobby>, LobbyError> {
        rpc(&self.actor, LobbyMessage::Current, self.timeout)
            .await
            .map_err(LobbyError::Actor)
    }

    pub async fn members(&self) -> Result<Vec<LobbyMember>, LobbyError> {
        rpc(&self.actor, LobbyMessage::Members, self.timeout)
            .await
            .map_err(LobbyError::Actor)?
    }

    /// Remember (or forget) the trip this device last worked on.
    pub async fn set_current_trip(&self, trip_id: Option<Uuid>) -> Result<(), LobbyError> {
        rpc(
            &self.actor,
            |reply| LobbyMessage::SetCurrentTrip { trip_id, reply },
            self.timeout,
        )
        .await
        .map_err(LobbyError::Actor)?
    }

    pub async fn current_trip_id(&self) -> Result<Option<Uuid>, LobbyError> {
        rpc(&self.actor, LobbyMessage::CurrentTripId, self.timeout)
            .await
            .map_err(LobbyError::Actor)?
    }

    /// Register an actor to be told about every current-lobby change.
    pub fn on_change<M, F>(&self, receiver: ActorRef<M>, convert: F)
    where
        M: Message,
        F: Fn(LobbyChanged) -> Option<M> + Send + 'static,
    {
        self.changes.subscribe(receiver, convert);
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}
