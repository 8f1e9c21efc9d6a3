//! URI-prefix routing from request paths to responder factories.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::request::{status_page, Context, OutStream, Responder};
use crate::request::environment::Environment;


/// A factory producing one [`Responder`] per incoming request.
pub type ResponderFactory = Arc<dyn Fn() -> Box<dyn Responder> + Send + Sync>;

/// Maps URI prefixes to responder factories.
///
/// Lookup tries an exact `SCRIPT_NAME` match first; failing that, the
/// longest registered prefix of the request URI's path wins. A miss yields
/// the built-in 404 responder.
#[derive(Default)]
pub struct Router {
    routes: Vec<(String, ResponderFactory)>,
}

impl Router {
    /// Creates an empty [`Router`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for requests whose path starts with `prefix`.
    pub fn route<F>(&mut self, prefix: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Responder> + Send + Sync + 'static,
    {
        self.routes.push((prefix.into(), Arc::new(factory)));
    }

    /// Instantiates the responder for a request, if any route matches.
    pub(crate) fn dispatch(&self, script_name: &str, request_uri: &str) -> Option<Box<dyn Responder>> {
        if !script_name.is_empty() {
            if let Some((_, factory)) = self.routes.iter().find(|(p, _)| p == script_name) {
                return Some(factory());
            }
        }

        let path = request_uri.split('?').next().unwrap_or(request_uri);
        self.routes
            .iter()
            .filter(|(p, _)| path.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len())
            .map(|(_, factory)| factory())
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish()
    }
}


/// The responder served when no route matches a request.
pub(crate) struct NotFound;

impl Responder for NotFound {
    fn respond(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
        status_page(cx.out, http::StatusCode::NOT_FOUND)?;
        Ok(true)
    }

    fn in_end(&mut self, _env: &Environment, _body: &[u8]) -> bool {
        // Whatever the body was, nobody is going to look at it.
        true
    }

    fn unknown_content_error_page(
        &mut self,
        _env: &Environment,
        out: &mut OutStream,
    ) -> io::Result<()> {
        status_page(out, http::StatusCode::NOT_FOUND)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use super::*;

    /// A router whose factories record which route fired.
    fn sample() -> (Router, Arc<Mutex<Vec<&'static str>>>) {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();
        for tag in ["/app", "/app/admin", "/other"] {
            let hits = hits.clone();
            router.route(tag, move || {
                hits.lock().unwrap().push(tag);
                Box::new(NotFound)
            });
        }
        (router, hits)
    }

    fn dispatched(router: &Router, hits: &Mutex<Vec<&'static str>>, script: &str, uri: &str)
        -> Option<&'static str>
    {
        let hit = router.dispatch(script, uri).is_some();
        let tag = hits.lock().unwrap().pop();
        assert_eq!(hit, tag.is_some());
        tag
    }

    #[test]
    fn longest_prefix_wins() {
        let (router, hits) = sample();
        assert_eq!(dispatched(&router, &hits, "", "/app/admin/users"), Some("/app/admin"));
        assert_eq!(dispatched(&router, &hits, "", "/app/public"), Some("/app"));
        assert_eq!(dispatched(&router, &hits, "", "/other"), Some("/other"));
        assert_eq!(dispatched(&router, &hits, "", "/nowhere"), None);
    }

    #[test]
    fn query_string_is_ignored_for_matching() {
        let (router, hits) = sample();
        assert_eq!(dispatched(&router, &hits, "", "/other?x=/app/admin"), Some("/other"));
        assert_eq!(dispatched(&router, &hits, "", "/misses?x=/app"), None);
    }

    #[test]
    fn exact_script_name_takes_precedence() {
        let (router, hits) = sample();
        // SCRIPT_NAME pins the shorter route even though the URI would
        // prefer the longer one.
        assert_eq!(dispatched(&router, &hits, "/app", "/app/admin/x"), Some("/app"));
        assert_eq!(dispatched(&router, &hits, "/unmapped", "/unmapped"), None);
    }
}
