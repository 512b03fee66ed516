//! HTML front-end that forwards queries to a coordinator.
//!
//! The front-end only talks to the coordinator through the client protocol in
//! [`crate::client`]. A request to `/` with a `q` parameter sends `q` as the
//! payload and renders the reply; without `q` it renders a form. Failures to
//! reach the coordinator render an exception page instead of an HTTP error.

use std::{collections::HashMap, fmt::Write, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    cli::FrontendArgs,
    client,
    frame::{Reply, Request},
    replica::ReplicaAddress,
};

const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone)]
pub struct FrontendState {
    pub coordinator: ReplicaAddress,
    pub timeout: Duration,
}

pub fn router(state: FrontendState) -> Router {
    Router::new()
        .route("/", get(index))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Entry point of the `frontend` subcommand.
pub async fn run(args: FrontendArgs) -> Result<()> {
    let listener = bind_or_ephemeral(args.listen).await?;
    info!("frontend listening on {}", listener.local_addr()?);

    let app = router(FrontendState {
        coordinator: args.coordinator,
        timeout: Duration::from_millis(args.timeout_ms),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
        .context("frontend server failed")
}

/// Binds `addr`, or an ephemeral port on the same interface when `addr` is taken.
async fn bind_or_ephemeral(addr: SocketAddr) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if addr.port() != 0 => {
            warn!(error = %err, "failed to bind {addr}; trying an ephemeral port");
            let fallback = SocketAddr::new(addr.ip(), 0);
            TcpListener::bind(fallback)
                .await
                .with_context(|| format!("failed to bind {fallback}"))
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind {addr}")),
    }
}

async fn index(
    State(state): State<Arc<FrontendState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let cookies = parse_cookies(&headers);
    let (session, issued) = match cookies.get(SESSION_COOKIE) {
        Some(session) => (session.clone(), false),
        None => (nanoid::nanoid!(), true),
    };

    let body = match query.get("q") {
        Some(question) => match ask(&state, question).await {
            Ok(reply) => render_reply(&session, question, &reply),
            Err(err) => {
                warn!(error = ?err, "coordinator request failed");
                render_exception(&err)
            }
        },
        None => render_form(&session),
    };

    let mut response = (
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/html"))],
        body,
    )
        .into_response();
    if issued {
        if let Ok(cookie) = HeaderValue::from_str(&format!("{SESSION_COOKIE}={session}; Path=/")) {
            response.headers_mut().insert(header::SET_COOKIE, cookie);
        }
    }
    response
}

async fn ask(state: &FrontendState, question: &str) -> Result<Reply> {
    client::send(&state.coordinator, &Request::new(question.as_bytes()), state.timeout).await
}

/// Parses every `Cookie` header into name/value pairs. Later duplicates win.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

fn render_form(session: &str) -> String {
    format!(
        "<html><body>\n<h1>Replica coordinator</h1>\n\
         <form method=\"get\" action=\"/\"><input name=\"q\"><input type=\"submit\"></form>\n\
         <p>session: {}</p>\n</body></html>\n",
        escape_html(session)
    )
}

fn render_reply(session: &str, question: &str, reply: &Reply) -> String {
    let mut body = String::from("<html><body>\n");
    let _ = writeln!(body, "<p>query: {}</p>", escape_html(question));
    match reply {
        Reply::Resolved(payload) => {
            let _ = writeln!(
                body,
                "<h1>Result</h1>\n<pre>{}</pre>",
                escape_html(&String::from_utf8_lossy(payload))
            );
        }
        Reply::Unresolved(unresolved) => {
            let _ = writeln!(
                body,
                "<h1>Unresolved</h1>\n<p>{}: {}</p>",
                unresolved.reason,
                escape_html(&unresolved.detail)
            );
        }
        Reply::Rejected(message) => {
            let _ = writeln!(body, "<h1>Rejected</h1>\n<p>{}</p>", escape_html(message));
        }
    }
    let _ = writeln!(body, "<p>session: {}</p>\n</body></html>", escape_html(session));
    body
}

fn render_exception(err: &anyhow::Error) -> String {
    format!(
        "<H1>Exception</H1>\n<PRE>\n{}\n</PRE>\n",
        escape_html(&format!("{err:?}"))
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
