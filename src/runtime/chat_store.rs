use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef, Message, OutputPort, RpcReplyPort, SpawnErr};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::identity::{IdentityError, IdentityProvider};
use super::lobby::{LobbyChanged, LobbyError, LobbyHandle};
use super::remote_store::{
    decode, decode_all, ChangeEvent, ChangeFilter, ChangeKind, ChangeSink, Query, RemoteError,
    RemoteStore, Subscription, Table,
};
use super::rpc;
use crate::domain::model::{ChatMessage, MessageType};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("not in a lobby; join one to chat")]
    NoLobby,
    #[error("message must not be blank")]
    BlankMessage,
    #[error(transparent)]
    Lobby(#[from] LobbyError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("chat store call failed: {0}")]
    Actor(String),
}

type Reply<T> = RpcReplyPort<Result<T, ChatError>>;

pub enum ChatStoreMessage {
    Subscribe {
        lobby_id: Uuid,
        reply: Reply<()>,
    },
    Load {
        lobby_id: Uuid,
        reply: Reply<()>,
    },
    Unsubscribe(RpcReplyPort<()>),
    Clear(RpcReplyPort<()>),
    Send {
        text: String,
        message_type: MessageType,
        metadata: Option<Value>,
        reply: Reply<ChatMessage>,
    },
    Messages(RpcReplyPort<Vec<ChatMessage>>),
    LobbyChanged(Option<Uuid>),
    RemoteInsert {
        subscription: u64,
        event: ChangeEvent,
    },
}

// ---------------------------------------------------------------------------
// ChatStoreActor
// ---------------------------------------------------------------------------

pub struct ChatStoreActor;

pub struct ChatStoreArgs {
    pub remote: Arc<dyn RemoteStore>,
    pub identity: Arc<IdentityProvider>,
    pub lobby: LobbyHandle,
    /// How many recent messages a backfill keeps.
    pub window: usize,
}

pub struct ChatStoreState {
    remote: Arc<dyn RemoteStore>,
    identity: Arc<IdentityProvider>,
    lobby: LobbyHandle,
    window: usize,
    appended: Arc<OutputPort<ChatMessage>>,
    lobby_id: Option<Uuid>,
    /// Ascending by `created_at`.
    messages: Vec<ChatMessage>,
    seen: HashSet<Uuid>,
    subscription: Option<Subscription>,
    subscription_generation: u64,
}

impl Actor for ChatStoreActor {
    type Msg = ChatStoreMessage;
    type State = ChatStoreState;
    type Arguments = (ChatStoreArgs, Arc<OutputPort<ChatMessage>>);

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        (args, appended): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(ChatStoreState {
            remote: args.remote,
            identity: args.identity,
            lobby: args.lobby,
            window: args.window.max(1),
            appended,
            lobby_id: None,
            messages: Vec::new(),
            seen: HashSet::new(),
            subscription: None,
            subscription_generation: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ChatStoreMessage::Subscribe { lobby_id, reply } => {
                let _ = reply.send(subscribe(&myself, state, lobby_id).await);
            }
            ChatStoreMessage::Load { lobby_id, reply } => {
                let _ = reply.send(load_messages(state, lobby_id).await);
            }
            ChatStoreMessage::Unsubscribe(reply) => {
                unsubscribe(state);
                let _ = reply.send(());
            }
            ChatStoreMessage::Clear(reply) => {
                unsubscribe(state);
                clear(state);
                let _ = reply.send(());
            }
            ChatStoreMessage::Send {
                text,
                message_type,
                metadata,
                reply,
            } => {
                let _ = reply.send(send_message(state, &text, message_type, metadata).await);
            }
            ChatStoreMessage::Messages(reply) => {
                let _ = reply.send(state.messages.clone());
            }
            ChatStoreMessage::LobbyChanged(hint) => {
                on_lobby_changed(&myself, state, hint).await;
            }
            ChatStoreMessage::RemoteInsert {
                subscription,
                event,
            } => {
                if subscription == state.subscription_generation && state.subscription.is_some() {
                    on_insert(state, event);
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        unsubscribe(state);
        Ok(())
    }
}

/// Open the feed first, then backfill, so nothing inserted in between is lost.
#[tracing::instrument(skip_all, fields(%lobby_id))]
async fn subscribe(
    myself: &ActorRef<ChatStoreMessage>,
    state: &mut ChatStoreState,
    lobby_id: Uuid,
) -> Result<(), ChatError> {
    unsubscribe(state);

    let subscription = state.subscription_generation;
    let actor = myself.clone();
    let sink: ChangeSink = Arc::new(move |event| {
        let _ = actor.send_message(ChatStoreMessage::RemoteInsert {
            subscription,
            event,
        });
    });
    let filter = ChangeFilter::table(Table::ChatMessages)
        .only(ChangeKind::Insert)
        .eq("lobby_id", lobby_id);
    state.subscription = Some(state.remote.subscribe(vec![filter], sink)?);

    if let Err(error) = load_messages(state, lobby_id).await {
        unsubscribe(state);
        clear(state);
        return Err(error);
    }
    debug!(messages = state.messages.len(), "chat subscribed");
    Ok(())
}

fn unsubscribe(state: &mut ChatStoreState) {
    if let Some(subscription) = state.subscription.take() {
        subscription.close();
    }
    state.subscription_generation += 1;
}

fn clear(state: &mut ChatStoreState) {
    state.lobby_id = None;
    state.messages.clear();
    state.seen.clear();
}

/// Replace local state with the newest `window` messages, oldest first.
async fn load_messages(state: &mut ChatStoreState, lobby_id: Uuid) -> Result<(), ChatError> {
    let rows = state
        .remote
        .select(
            &Query::new(Table::ChatMessages)
                .eq("lobby_id", lobby_id)
                .order_by("created_at", false)
                .limit(state.window),
        )
        .await?;
    let mut messages: Vec<ChatMessage> = decode_all(rows)?;
    messages.reverse();

    state.seen = messages.iter().map(|m| m.id).collect();
    state.messages = messages;
    state.lobby_id = Some(lobby_id);
    Ok(())
}

fn on_insert(state: &mut ChatStoreState, event: ChangeEvent) {
    let message: ChatMessage = match decode(event.record) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "dropping malformed chat message");
            return;
        }
    };
    if state.lobby_id != Some(message.lobby_id) || !state.seen.insert(message.id) {
        return;
    }
    // Late arrivals are placed by timestamp; equal timestamps keep arrival order.
    let at = state
        .messages
        .partition_point(|m| m.created_at <= message.created_at);
    state.messages.insert(at, message.clone());
    state.appended.send(message);
}

/// Remote insert only. The message appears locally when the feed echoes it.
async fn send_message(
    state: &mut ChatStoreState,
    text: &str,
    message_type: MessageType,
    metadata: Option<Value>,
) -> Result<ChatMessage, ChatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::BlankMessage);
    }
    let lobby = state.lobby.current_lobby().await?.ok_or(ChatError::NoLobby)?;
    let participant = state.identity.get_or_create()?;

    let row = json!({
        "lobby_id": lobby.id,
        "user_id": participant.id,
        "message": text,
        "message_type": message_type,
        "metadata": metadata,
    });
    Ok(decode(state.remote.insert(Table::ChatMessages, row).await?)?)
}

async fn on_lobby_changed(
    myself: &ActorRef<ChatStoreMessage>,
    state: &mut ChatStoreState,
    hint: Option<Uuid>,
) {
    let current = match state.lobby.current_lobby().await {
        Ok(lobby) => lobby.map(|l| l.id),
        Err(error) => {
            warn!(%error, "could not resolve current lobby");
            hint
        }
    };
    match current {
        Some(lobby_id) if state.lobby_id == Some(lobby_id) && state.subscription.is_some() => {}
        Some(lobby_id) => {
            if let Err(error) = subscribe(myself, state, lobby_id).await {
                warn!(%lobby_id, %error, "could not load chat for lobby");
            }
        }
        None => {
            info!("lobby cleared; dropping chat");
            unsubscribe(state);
            clear(state);
        }
    }
}

// ---------------------------------------------------------------------------
// ChatStoreHandle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ChatStoreHandle {
    actor: ActorRef<ChatStoreMessage>,
    appended: Arc<OutputPort<ChatMessage>>,
    timeout: Duration,
}

/// Spawn the store and bind it to lobby changes.
pub async fn spawn_chat_store(
    args: ChatStoreArgs,
    timeout: Duration,
) -> Result<(ChatStoreHandle, JoinHandle<()>), SpawnErr> {
    let lobby = args.lobby.clone();
    let appended = Arc::new(OutputPort::default());
    let (actor, handle) = Actor::spawn(None, ChatStoreActor, (args, appended.clone())).await?;
    lobby.on_change(actor.clone(), |LobbyChanged(lobby)| {
        Some(ChatStoreMessage::LobbyChanged(lobby.map(|l| l.id)))
    });
    Ok((
        ChatStoreHandle {
            actor,
            appended,
            timeout,
        },
        handle,
    ))
}

impl ChatStoreHandle {
    pub async fn subscribe(&self, lobby_id: Uuid) -> Result<(), ChatError> {
        rpc(
            &self.actor,
            |reply| ChatStoreMessage::Subscribe { lobby_id, reply },
            self.timeout,
        )
        .await
        .map_err(ChatError::Actor)?
    }

    pub async fn load_messages(&self, lobby_id: Uuid) -> Result<(), ChatError> {
        rpc(
            &self.actor,
            |reply| ChatStoreMessage::Load { lobby_id, reply },
            self.timeout,
        )
        .await
        .map_err(ChatError::Actor)?
    }

    pub async fn unsubscribe(&self) -> Result<(), ChatError> {
        rpc(&self.actor, ChatStoreMessage::Unsubscribe, self.timeout)
            .await
            .map_err(ChatError::Actor)
    }

    pub async fn clear_messages(&self) -> Result<(), ChatError> {
        rpc(&self.actor, ChatStoreMessage::Clear, self.timeout)
            .await
            .map_err(ChatError::Actor)
    }

    pub async fn send_message(
        &self,
        text: &str,
        message_type: MessageType,
        metadata: Option<Value>,
    ) -> Result<ChatMessage, ChatError> {
        let text = text.to_string();
        rpc(
            &self.actor,
            |reply| ChatStoreMessage::Send {
                text,
                message_type,
                metadata,
                reply,
            },
            self.timeout,
        )
        .await
        .map_err(ChatError::Actor)?
    }

    pub async fn messages(&self) -> Result<Vec<ChatMessage>, ChatError> {
        rpc(&self.actor, ChatStoreMessage::Messages, self.timeout)
            .await
            .map_err(ChatError::Actor)
    }

    /// Register an actor to receive every message appended from the feed.
    pub fn on_message<M, F>(&self, receiver: ActorRef<M>, convert: F)
    where
        M: Message,
        F: Fn(ChatMessage) -> Option<M> + Send + 'static,
    {
        self.appended.subscribe(receiver, convert);
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as Span;

    use super::*;
    use crate::domain::config::LobbyConfig;
    use crate::runtime::lobby::{spawn_lobby, LobbyArgs};
    use crate::runtime::remote_store::InMemoryRemoteStore;
    use crate::runtime::storage::{LocalStorage, MemoryStorage};
    use crate::runtime::testing::{eventually, settle};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Client {
        lobby: LobbyHandle,
        chat: ChatStoreHandle,
    }

    async fn client(remote: &InMemoryRemoteStore, window: usize) -> Client {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::default());
        let identity = Arc::new(IdentityProvider::new(storage.clone()));
        let remote: Arc<dyn RemoteStore> = Arc::new(remote.clone());
        let (lobby, _) = spawn_lobby(
            LobbyArgs {
                remote: remote.clone(),
                storage,
                identity: identity.clone(),
                config: LobbyConfig::default(),
                invite_codes: None,
            },
            TIMEOUT,
        )
        .await
        .unwrap();
        let (chat, _) = spawn_chat_store(
            ChatStoreArgs {
                remote,
                identity,
                lobby: lobby.clone(),
                window,
            },
            TIMEOUT,
        )
        .await
        .unwrap();
        Client { lobby, chat }
    }

    fn texts(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.message.as_str()).collect()
    }

    async fn wait_for(chat: &ChatStoreHandle, expected: &[&str]) {
        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        let chat = chat.clone();
        eventually(move || {
            let chat = chat.clone();
            let expected = expected.clone();
            async move {
                let messages = chat.messages().await.unwrap();
                texts(&messages) == expected.iter().map(String::as_str).collect::<Vec<_>>()
            }
        })
        .await;
    }

    /// Wait for the lobby-driven auto-subscription to land.
    async fn subscribed(remote: &InMemoryRemoteStore) {
        let remote = remote.clone();
        eventually(move || {
            let remote = remote.clone();
            async move { remote.subscriber_count() == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn third_subscriber_sees_both_sends_in_order() {
        let remote = InMemoryRemoteStore::new();
        let a = client(&remote, 100).await;
        let b = client(&remote, 100).await;
        let c = client(&remote, 100).await;

        let lobby = a.lobby.create_lobby("Trip Test", None).await.unwrap();
        b.lobby.join_lobby(&lobby.invite_code).await.unwrap();
        c.lobby.join_lobby(&lobby.invite_code).await.unwrap();
        c.chat.subscribe(lobby.id).await.unwrap();

        a.chat.send_message("hi", MessageType::User, None).await.unwrap();
        b.chat.send_message("hello", MessageType::User, None).await.unwrap();

        wait_for(&c.chat, &["hi", "hello"]).await;
        wait_for(&a.chat, &["hi", "hello"]).await;
    }

    #[tokio::test]
    async fn backfill_keeps_newest_window_ascending() {
        let remote = InMemoryRemoteStore::new();
        let a = client(&remote, 2).await;
        let lobby = a.lobby.create_lobby("Trip Test", None).await.unwrap();
        for text in ["one", "two", "three"] {
            a.chat.send_message(text, MessageType::User, None).await.unwrap();
        }

        let late = client(&remote, 2).await;
        late.chat.load_messages(lobby.id).await.unwrap();
        let messages = late.chat.messages().await.unwrap();
        assert_eq!(texts(&messages), vec!["two", "three"]);
    }

    #[tokio::test]
    async fn duplicates_are_dropped_and_late_events_ordered() {
        let remote = InMemoryRemoteStore::new();
        let a = client(&remote, 100).await;
        let lobby = a.lobby.create_lobby("Trip Test", None).await.unwrap();
        let first = a.chat.send_message("first", MessageType::User, None).await.unwrap();
        a.chat.send_message("second", MessageType::User, None).await.unwrap();
        wait_for(&a.chat, &["first", "second"]).await;

        let echo = ChangeEvent {
            kind: ChangeKind::Insert,
            table: Table::ChatMessages,
            record: serde_json::to_value(&first).unwrap(),
        };
        remote.emit(echo.clone());
        remote.emit(echo);

        let early = ChatMessage {
            id: Uuid::new_v4(),
            lobby_id: lobby.id,
            user_id: "someone".into(),
            message: "zeroth".into(),
            message_type: MessageType::System,
            metadata: None,
            created_at: first.created_at - Span::seconds(1),
        };
        remote.emit(ChangeEvent {
            kind: ChangeKind::Insert,
            table: Table::ChatMessages,
            record: serde_json::to_value(&early).unwrap(),
        });

        wait_for(&a.chat, &["zeroth", "first", "second"]).await;
        settle().await;
        assert_eq!(a.chat.messages().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn send_requires_lobby_and_text() {
        let remote = InMemoryRemoteStore::new();
        let a = client(&remote, 100).await;
        assert!(matches!(
            a.chat.send_message("hi", MessageType::User, None).await,
            Err(ChatError::NoLobby)
        ));

        a.lobby.create_lobby("Trip Test", None).await.unwrap();
        assert!(matches!(
            a.chat.send_message("   ", MessageType::User, None).await,
            Err(ChatError::BlankMessage)
        ));
    }

    #[tokio::test]
    async fn send_does_not_append_locally() {
        let remote = InMemoryRemoteStore::new();
        let a = client(&remote, 100).await;
        a.lobby.create_lobby("Trip Test", None).await.unwrap();
        subscribed(&remote).await;
        a.chat.unsubscribe().await.unwrap();

        let sent = a
            .chat
            .send_message("quiet", MessageType::Ai, Some(json!({"source": "agent"})))
            .await
            .unwrap();
        assert_eq!(sent.message_type, MessageType::Ai);
        settle().await;
        assert!(a.chat.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn follows_the_current_lobby() {
        let remote = InMemoryRemoteStore::new();
        let a = client(&remote, 100).await;
        a.lobby.create_lobby("First", None).await.unwrap();
        a.chat.send_message("in first", MessageType::User, None).await.unwrap();
        wait_for(&a.chat, &["in first"]).await;

        a.lobby.create_lobby("Second", None).await.unwrap();
        wait_for(&a.chat, &[]).await;
        assert_eq!(remote.subscriber_count(), 1);

        a.lobby.leave_lobby().await.unwrap();
        let remote_watch = remote.clone();
        eventually(move || {
            let remote = remote_watch.clone();
            async move { remote.subscriber_count() == 0 }
        })
        .await;
        assert!(a.chat.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_backfill_leaves_nothing_open() {
        let remote = InMemoryRemoteStore::new();
        let a = client(&remote, 100).await;
        let lobby = a.lobby.create_lobby("Trip Test", None).await.unwrap();
        subscribed(&remote).await;
        a.chat.clear_messages().await.unwrap();
        assert_eq!(remote.subscriber_count(), 0);

        remote.unprovision(Table::ChatMessages);
        let err = a.chat.subscribe(lobby.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Remote(RemoteError::NotProvisioned(_))));
        assert_eq!(remote.subscriber_count(), 0);
    }
}
