//! HTTP gateway using Axum.
//!
//! Everything page-scoped lives under `/page/<url>/...`. Page URLs contain
//! slashes themselves, so the router hands the whole tail to
//! [`PageRoute::parse`], which finds the page with the catalog's prefix
//! matching and interprets the rest.

use crate::catalog::Page;
use crate::error::{ApiError, RegistryError};
use crate::ids::{parse_widget_index, IdError, PageId, WidgetId};
use crate::protocol::{decode_base64, ClientFrame, Rejected};
use crate::registry::{Attachment, DetachGuard, SessionInfo, SessionRegistry};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::Method,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::get,
    Json, Router,
};
use futures_util::{stream, SinkExt, StreamExt};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Comment lines sent on idle event streams; also how quickly a vanished
/// client is noticed.
const KEEP_ALIVE: Duration = Duration::from_secs(10);

/// What a request under `/page/<url>/` addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Widgets,
    ButtonClick(WidgetId),
    EditorContents(WidgetId),
    TerminalInput(WidgetId),
    Updates(PageId),
    Socket(PageId),
}

#[derive(Debug)]
struct PageRoute {
    page: Arc<Page>,
    action: Action,
}

impl PageRoute {
    fn parse(state: &AppState, tail: &str) -> Result<Self, ApiError> {
        let path = format!("/{}", tail);
        let (page, rest) = state
            .catalog
            .match_prefix(&path)
            .ok_or_else(|| RegistryError::PageNotFound(path.clone()))?;
        let url = page.url.clone();
        let segments: Vec<&str> = rest.split('/').collect();
        let page_id = |sid: Option<&&str>| -> Result<PageId, IdError> {
            PageId::from_parts(&url, sid.copied().unwrap_or_default())
        };

        let action = match segments.as_slice() {
            ["widgets"] => Action::Widgets,
            ["updates", sid] => Action::Updates(page_id(Some(sid))?),
            ["socket", sid] => Action::Socket(page_id(Some(sid))?),
            ["widget", index, kind, sid @ ..]
                if matches!(*kind, "button-click" | "editor-contents" | "terminal-input")
                    && sid.len() <= 1 =>
            {
                let index = parse_widget_index(index)?;
                let widget = page_id(sid.first())?.widget(index);
                match *kind {
                    "button-click" => Action::ButtonClick(widget),
                    "editor-contents" => Action::EditorContents(widget),
                    _ => Action::TerminalInput(widget),
                }
            }
            _ => return Err(ApiError::NoRoute(path)),
        };
        Ok(Self { page, action })
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pages", get(list_pages))
        .route("/sessions", get(list_sessions))
        .route("/page/*tail", get(page_get).post(page_post))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Run the HTTP server on the given port. On Ctrl-C every session is torn
/// down before the server stops, which also ends the open client streams.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);

    let registry = state.registry.clone();
    serve(listener, state, async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
        registry.shutdown().await;
    })
    .await
}

async fn health() -> &'static str {
    "OK"
}

async fn list_pages(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut urls = state.catalog.list_pages().to_vec();
    urls.sort();
    Json(urls)
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.sessions())
}

async fn page_get(
    State(state): State<AppState>,
    Path(tail): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ApiError> {
    let route = PageRoute::parse(&state, &tail)?;
    match route.action {
        Action::Widgets => Ok(Json(route.page.widgets.clone()).into_response()),
        Action::ButtonClick(widget_id) => {
            state.registry.dispatch_button_click(&widget_id).await?;
            Ok("OK".into_response())
        }
        Action::Updates(page_id) => {
            let attachment = state.registry.attach(&page_id).await?;
            Ok(updates_stream(state.registry.clone(), attachment).into_response())
        }
        Action::Socket(page_id) => {
            let ws = ws.ok_or_else(|| {
                ApiError::NoRoute(format!("{} (not a WebSocket upgrade)", page_id))
            })?;
            let attachment = state.registry.attach(&page_id).await?;
            let registry = state.registry.clone();
            let guard = DetachGuard::new(registry.clone(), page_id, attachment.stream_id);
            Ok(ws
                .on_upgrade(move |socket| handle_socket(socket, registry, attachment, guard))
                .into_response())
        }
        Action::EditorContents(_) | Action::TerminalInput(_) => {
            Err(ApiError::NoRoute(format!("{} /page/{}", Method::GET, tail)))
        }
    }
}

async fn page_post(
    State(state): State<AppState>,
    Path(tail): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let route = PageRoute::parse(&state, &tail)?;
    match route.action {
        Action::EditorContents(widget_id) => {
            state.registry.dispatch_editor_write(&widget_id, body).await?;
        }
        Action::TerminalInput(widget_id) => {
            state.registry.dispatch_terminal_input(&widget_id, body).await?;
        }
        _ => return Err(ApiError::NoRoute(format!("{} /page/{}", Method::POST, tail))),
    }
    Ok("OK".into_response())
}

/// Server-sent events for one attached stream. The stream owns the detach
/// guard, so the session is released when the client goes away.
fn updates_stream(
    registry: Arc<SessionRegistry>,
    attachment: Attachment,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let Attachment {
        page_id,
        stream_id,
        updates,
    } = attachment;
    let guard = DetachGuard::new(registry, page_id, stream_id);
    let stream = stream::unfold((updates, guard), |(mut updates, guard)| async move {
        let update = updates.recv().await?;
        let event = Event::default()
            .event(update.event())
            .data(update.sse_data());
        Some((Ok(event), (updates, guard)))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}

async fn handle_socket(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    attachment: Attachment,
    _guard: DetachGuard,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let Attachment {
        page_id,
        stream_id,
        mut updates,
    } = attachment;
    debug!(page_id = %page_id, stream_id = %stream_id, "WebSocket connected");

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                if ws_tx.send(Message::Text(update.ws_frame())).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(rejected) = apply_frame(&registry, &page_id, &text).await {
                            let frame = serde_json::to_string(&rejected).unwrap_or_default();
                            if ws_tx.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = ws_tx.close().await;
    debug!(page_id = %page_id, stream_id = %stream_id, "WebSocket closed");
}

async fn apply_frame(
    registry: &SessionRegistry,
    page_id: &PageId,
    text: &str,
) -> Result<(), Rejected> {
    let frame: ClientFrame = serde_json::from_str(text)
        .map_err(|e| Rejected::new(None, "malformedInput", e.to_string()))?;
    let (index, result) = match frame {
        ClientFrame::ButtonClick { widget_index } => (
            widget_index,
            registry
                .dispatch_button_click(&page_id.widget(widget_index))
                .await,
        ),
        ClientFrame::EditorContents {
            widget_index,
            contents,
        } => (
            widget_index,
            registry
                .dispatch_editor_write(&page_id.widget(widget_index), Bytes::from(contents))
                .await,
        ),
        ClientFrame::TerminalInput { widget_index, data } => {
            let data = decode_base64(&data).map_err(|e| {
                Rejected::new(Some(widget_index), "malformedInput", e.to_string())
            })?;
            (
                widget_index,
                registry
                    .dispatch_terminal_input(&page_id.widget(widget_index), Bytes::from(data))
                    .await,
            )
        }
    };
    result.map_err(|e| {
        warn!(page_id = %page_id, widget_index = index, "Rejected socket action: {}", e);
        Rejected::new(Some(index), e.kind(), e.to_string())
    })
}
