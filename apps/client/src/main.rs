use std::collections::BTreeSet;
use std::sync::Arc;

use shared_proto::auth::AuthEvent;
use socialchat_client::api::{profiles, AuthApi, BackendClient};
use socialchat_client::config::{ClientConfig, CACHE_TTL_HOURS};
use socialchat_client::connectivity::Connectivity;
use socialchat_client::error::AppResult;
use socialchat_client::messaging::service::MessagingService;
use socialchat_client::messaging::storage::MessagingStorage;
use socialchat_client::notify::{Notifier, Toaster};
use socialchat_client::observability;
use socialchat_client::realtime::socket::RealtimeClient;
use socialchat_client::session::{SessionGuard, SessionState};
use socialchat_client::storage::LocalStore;
use socialchat_client::store::AppStore;
use socialchat_client::sync::feed::FeedSync;
use socialchat_client::sync::friends::FriendGraph;
use socialchat_client::sync::notifications::NotificationInbox;
use socialchat_client::sync::stories::StoryList;
use socialchat_client::sync::thread::MessageThread;
use socialchat_client::sync::SyncContext;
use socialchat_client::validation::SignInForm;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() {
    observability::init_tracing();

    if let Err(err) = run().await {
        tracing::error!(
            component = "bootstrap",
            code = ?err.code,
            details = ?err.details,
            error = %err,
            "client stopped"
        );
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let config = ClientConfig::from_env()?;
    let local = LocalStore::open(config.database_path()).await?;
    local
        .sweep_cache(chrono::Duration::hours(CACHE_TTL_HOURS))
        .await?;

    let app_store = AppStore::load(local.clone()).await?;
    let backend = Arc::new(BackendClient::new(
        config.backend_url.clone(),
        config.anon_key.clone(),
    )?);
    let auth: Arc<dyn AuthApi> = backend.clone();

    let guard = SessionGuard::start(auth.clone(), local.clone());
    let _follow = app_store.follow_session(guard.view());

    let mut state = guard.ready().await;
    if state == SessionState::Unauthenticated {
        if let (Some(email), Some(password)) = (&config.email, &config.password) {
            let form = SignInForm {
                email: email.clone(),
                password: password.clone(),
            };
            profiles::sign_in(auth.as_ref(), &form).await?;
            let mut rx = guard.view().watch();
            let signed_in = rx
                .wait_for(|s| matches!(s, SessionState::Authenticated(_)))
                .await
                .map(|next| next.clone());
            if let Ok(next) = signed_in {
                state = next;
            }
        }
    }

    let Some(session) = state.session().cloned() else {
        let decision = guard.route("/");
        tracing::info!(
            component = "bootstrap",
            redirect = ?decision.redirect_target(),
            "no session; set SOCIALCHAT_EMAIL and SOCIALCHAT_PASSWORD to sign in"
        );
        return Ok(());
    };
    tracing::info!(component = "bootstrap", user_id = %session.user_id(), theme = ?app_store.theme(), "signed in");

    let connectivity = Connectivity::new(false);
    let realtime = Arc::new(RealtimeClient::connect(
        backend.realtime_url()?,
        Some(session.access_token.clone()),
        connectivity.clone(),
    ));
    let _token_forwarder = {
        let realtime = realtime.clone();
        let mut events = auth.subscribe_auth();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AuthEvent::TokenRefreshed(session)) | Ok(AuthEvent::SignedIn(session)) => {
                        realtime.set_access_token(Some(session.access_token));
                    }
                    Ok(AuthEvent::SignedOut) => realtime.set_access_token(None),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let toaster = Toaster::default();
    let ctx = SyncContext {
        backend: backend.clone(),
        feed: realtime.clone(),
        toaster: toaster.clone(),
        user_id: session.user_id(),
        config: config.sync.clone(),
    };

    // A failed first load is reported and retried once the socket is up.
    let feed = Arc::new(FeedSync::start(ctx.clone()).await);
    let friends = Arc::new(FriendGraph::start(ctx.clone()).await);
    let stories = Arc::new(StoryList::start(ctx.clone()).await);
    let inbox = Arc::new(
        NotificationInbox::start(ctx.clone(), Arc::new(Notifier::toast_only(toaster.clone()))).await,
    );

    tracing::info!(
        component = "bootstrap",
        posts = feed.view().read(|s| s.posts.len()),
        friends = friends.view().read(|s| s.friends.len()),
        incoming_requests = friends.view().read(|s| s.incoming.len()),
        stories = stories.view().read(|s| s.stories.len()),
        unread_notifications = inbox.unread_count(),
        "initial sync complete"
    );

    let _reload_on_reconnect = {
        let (feed, friends, stories, inbox) =
            (feed.clone(), friends.clone(), stories.clone(), inbox.clone());
        let mut online = connectivity.subscribe();
        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                if !*online.borrow_and_update() {
                    continue;
                }
                // Errors were already reported as toasts.
                if !feed.view().read(|s| s.loaded) {
                    let _ = feed.refresh().await;
                }
                if !friends.view().read(|s| s.loaded) {
                    let _ = friends.refresh().await;
                }
                if !stories.view().read(|s| s.loaded) {
                    let _ = stories.refresh().await;
                }
                if !inbox.view().read(|s| s.loaded) {
                    let _ = inbox.refresh().await;
                }
            }
        })
    };

    // Threads with queued messages flush themselves once the socket is up.
    let outbox = MessagingService::new(MessagingStorage::new(local.pool().clone()).await?);
    let peers = outbox
        .list_outbox(500)
        .await?
        .into_iter()
        .filter(|m| m.sender_id == session.user_id())
        .map(|m| m.receiver_id)
        .collect::<BTreeSet<_>>();
    let mut threads = Vec::with_capacity(peers.len());
    for peer in peers {
        threads.push(MessageThread::start(ctx.clone(), outbox.clone(), connectivity.clone(), peer).await);
    }
    if !threads.is_empty() {
        tracing::info!(component = "bootstrap", threads = threads.len(), "draining queued messages");
    }

    let mut toasts = toaster.subscribe();
    loop {
        tokio::select! {
            toast = toasts.recv() => match toast {
                Ok(toast) => tracing::info!(
                    component = "toast",
                    variant = ?toast.variant,
                    title = %toast.title,
                    description = ?toast.description,
                    "toast"
                ),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(component = "toast", skipped, "toasts dropped"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(component = "bootstrap", "shutting down");
                break;
            }
        }
    }

    Ok(())
}
