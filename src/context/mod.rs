//! Per-request context: the parsed request plus typed extensions that middleware
//! attach for the layers after it (for example the gate's [`ClientId`](crate::security::ClientId)).

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::Request;

/// Type-erased request extensions map, keyed by type.
///
/// # Examples
///
/// ```
/// use upguard::context::Extensions;
/// use upguard::security::ClientId;
///
/// let mut extensions = Extensions::new();
/// extensions.insert(ClientId("198.51.100.7".into()));
/// assert_eq!(extensions.get::<ClientId>().map(|c| c.0.as_str()), Some("198.51.100.7"));
/// assert!(extensions.remove::<ClientId>().is_some());
/// assert!(extensions.get::<ClientId>().is_none());
/// ```
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any previous value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Returns the value of type `T`, if present.
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Takes the value of type `T` out of the map.
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Per-request context handed down the middleware chain.
pub struct Context {
    request: Request,
    extensions: Extensions,
}

impl Context {
    /// Wraps `request` with empty extensions.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
        }
    }

    /// The request being handled.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Values attached by earlier layers.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Mutable access for layers that attach values.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Actor(&'static str);

    fn context(raw: &[u8]) -> Context {
        Context::new(Request::parse(raw).unwrap().0)
    }

    #[test]
    fn extensions_are_typed() {
        let mut ctx = context(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(ctx.extensions().get::<Actor>().is_none());
        ctx.extensions_mut().insert(Actor("ana"));
        assert_eq!(ctx.extensions().get::<Actor>(), Some(&Actor("ana")));
        assert_eq!(ctx.extensions_mut().remove::<Actor>(), Some(Actor("ana")));
        assert!(ctx.extensions().get::<Actor>().is_none());
    }

    #[test]
    fn json_body() {
        let ctx = context(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n{\"id\":\"j\"}");
        let value: serde_json::Value = ctx.json().unwrap();
        assert_eq!(value["id"], "j");
    }
}
