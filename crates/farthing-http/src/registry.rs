use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{event, Level};

use crate::request::Request;

/// Collaborator-supplied callable invoked by a worker to produce a reply.
///
/// The second argument is the part of the URI after the registered
/// prefix. Handlers either call [`Request::write_reply`] or drop the
/// request, which synthesizes a 500.
pub type Handler = Arc<dyn Fn(&mut Request, &str) + Send + Sync>;

struct PathHandler {
    prefix: String,
    exact_match: bool,
    handler: Handler,
}

/// Handlers for (sub)paths, consulted in registration order.
static PATH_HANDLERS: RwLock<Vec<PathHandler>> = RwLock::new(Vec::new());

pub fn register_http_handler(prefix: &str, exact_match: bool, handler: Handler) {
    event!(Level::DEBUG, prefix, exact_match, "registering HTTP handler");
    PATH_HANDLERS.write().push(PathHandler {
        prefix: prefix.to_string(),
        exact_match,
        handler,
    });
}

/// Remove the first handler registered for `(prefix, exact_match)`, if
/// any.
pub fn unregister_http_handler(prefix: &str, exact_match: bool) {
    let mut handlers = PATH_HANDLERS.write();
    let position = handlers
        .iter()
        .position(|h| h.prefix == prefix && h.exact_match == exact_match);
    if let Some(position) = position {
        event!(Level::DEBUG, prefix, exact_match, "unregistering HTTP handler");
        handlers.remove(position);
    }
}

/// First handler matching `uri`, with the URI remainder after the
/// matched prefix.
pub(crate) fn lookup(uri: &str) -> Option<(Handler, String)> {
    let handlers = PATH_HANDLERS.read();
    for entry in handlers.iter() {
        let matched = if entry.exact_match {
            uri == entry.prefix
        } else {
            uri.starts_with(&entry.prefix)
        };
        if matched {
            let path = uri[entry.prefix.len()..].to_string();
            return Some((Arc::clone(&entry.handler), path));
        }
    }
    None
}
