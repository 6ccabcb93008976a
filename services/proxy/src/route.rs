//! Route handles and the per-worker route table.
//!
//! A route tree decides which destinations a request visits. Leaves are
//! [`DestinationRoute`]s; inner nodes pick or retry among their children.
//! Route trees are built on the worker that runs them, from a
//! [`ConfigBuilder`] broadcast by the router.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcroute_proto::{AccessPoint, Reply, Request, ResultCode};

use crate::destination::ProxyDestination;
use crate::proxy::Proxy;

/// A node in a route tree.
#[async_trait(?Send)]
pub trait RouteHandle {
    async fn route(&self, request: &Request) -> Reply;

    /// Short description for logs and service info.
    fn describe(&self) -> String;
}

pub type RouteHandlePtr = Rc<dyn RouteHandle>;

/// Sends to one destination, skipping it while it is TKO.
pub struct DestinationRoute {
    destination: Rc<ProxyDestination>,
    timeout: Duration,
}

impl DestinationRoute {
    pub fn new(destination: Rc<ProxyDestination>, timeout: Duration) -> Self {
        Self {
            destination,
            timeout,
        }
    }

    pub fn destination(&self) -> &Rc<ProxyDestination> {
        &self.destination
    }
}

#[async_trait(?Send)]
impl RouteHandle for DestinationRoute {
    async fn route(&self, request: &Request) -> Reply {
        let mut reply = if self.destination.may_send() {
            self.destination.send(request, self.timeout).await
        } else {
            self.destination.on_reply(ResultCode::Tko, None);
            Reply::new(ResultCode::Tko).with_message("destination is TKO")
        };
        reply.destination = Some(self.destination.access_point().to_string());
        reply
    }

    fn describe(&self) -> String {
        format!("destination|{}", self.destination.key())
    }
}

/// Tries children in order until one gives a non-failover reply.
pub struct FailoverRoute {
    children: Vec<RouteHandlePtr>,
}

impl FailoverRoute {
    pub fn new(children: Vec<RouteHandlePtr>) -> Self {
        Self { children }
    }
}

#[async_trait(?Send)]
impl RouteHandle for FailoverRoute {
    async fn route(&self, request: &Request) -> Reply {
        failover(&self.children, 0, request).await
    }

    fn describe(&self) -> String {
        format!("failover|{}", self.children.len())
    }
}

/// Picks a child by key hash.
pub struct HashRoute {
    children: Vec<RouteHandlePtr>,
    failover: bool,
}

impl HashRoute {
    /// With `failover`, a failed child hands over to the ones after it.
    pub fn new(children: Vec<RouteHandlePtr>, failover: bool) -> Self {
        Self { children, failover }
    }

    pub fn pick(&self, key: &str) -> Option<usize> {
        if self.children.is_empty() {
            return None;
        }
        Some((fnv1a_64(key.as_bytes()) % self.children.len() as u64) as usize)
    }
}

#[async_trait(?Send)]
impl RouteHandle for HashRoute {
    async fn route(&self, request: &Request) -> Reply {
        let Some(start) = self.pick(&request.key) else {
            return Reply::local_error("hash route has no children");
        };
        if self.failover {
            failover(&self.children, start, request).await
        } else {
            self.children[start].route(request).await
        }
    }

    fn describe(&self) -> String {
        format!("hash|{}", self.children.len())
    }
}

/// Replies with a fixed local error.
pub struct ErrorRoute {
    message: String,
}

impl ErrorRoute {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait(?Send)]
impl RouteHandle for ErrorRoute {
    async fn route(&self, _request: &Request) -> Reply {
        Reply::local_error(self.message.clone())
    }

    fn describe(&self) -> String {
        format!("error|{}", self.message)
    }
}

/// Visit `children` starting at `start`, wrapping around, while replies are
/// failover errors. Returns the last reply.
async fn failover(children: &[RouteHandlePtr], start: usize, request: &Request) -> Reply {
    let mut last = Reply::local_error("no route children");
    for offset in 0..children.len() {
        let child = &children[(start + offset) % children.len()];
        last = child.route(request).await;
        if !last.result.is_failover_error() {
            break;
        }
    }
    last
}

/// 64-bit FNV-1a.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// A worker's route table. Requests keep the table they started with.
pub struct ProxyConfig {
    root: RouteHandlePtr,
}

impl ProxyConfig {
    pub fn new(root: RouteHandlePtr) -> Self {
        Self { root }
    }

    /// Table that fails every request.
    pub fn unconfigured() -> Self {
        Self::new(Rc::new(ErrorRoute::new("no route configured")))
    }

    pub fn root(&self) -> &RouteHandlePtr {
        &self.root
    }
}

/// Builds a worker's [`ProxyConfig`] on that worker.
pub type ConfigBuilder = Arc<dyn Fn(&Proxy) -> ProxyConfig + Send + Sync>;

/// Hash `servers` by key, optionally failing over to the next server.
pub fn pool_config(servers: Vec<AccessPoint>, timeout: Duration, failover: bool) -> ConfigBuilder {
    let servers: Vec<Arc<AccessPoint>> = servers.into_iter().map(Arc::new).collect();

    Arc::new(move |proxy: &Proxy| {
        let children = servers
            .iter()
            .map(|ap| {
                let destination = proxy
                    .destination_map()
                    .emplace(Arc::clone(ap), timeout, 0, 0);
                Rc::new(DestinationRoute::new(destination, timeout)) as RouteHandlePtr
            })
            .collect();
        ProxyConfig::new(Rc::new(HashRoute::new(children, failover)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Replies with a fixed code and records the keys it saw.
    struct Fixed {
        result: ResultCode,
        seen: RefCell<Vec<String>>,
    }

    impl Fixed {
        fn new(result: ResultCode) -> Rc<Self> {
            Rc::new(Self {
                result,
                seen: RefCell::new(Vec::new()),
            })
        }
    }

    #[async_trait(?Send)]
    impl RouteHandle for Fixed {
        async fn route(&self, request: &Request) -> Reply {
            self.seen.borrow_mut().push(request.key.clone());
            Reply::new(self.result)
        }

        fn describe(&self) -> String {
            format!("fixed|{}", self.result)
        }
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    proptest::proptest! {
        #[test]
        fn prop_pick_is_in_range(key in "[!-~]{1,64}", n in 1usize..16) {
            let children = (0..n)
                .map(|_| Rc::new(ErrorRoute::new("x")) as RouteHandlePtr)
                .collect();
            let route = HashRoute::new(children, false);
            let picked = route.pick(&key).unwrap();
            proptest::prop_assert!(picked < n);
            proptest::prop_assert_eq!(route.pick(&key), Some(picked));
        }
    }

    #[tokio::test]
    async fn test_failover_stops_at_first_answer() {
        let a = Fixed::new(ResultCode::Timeout);
        let b = Fixed::new(ResultCode::NotFound);
        let c = Fixed::new(ResultCode::Found);
        let route = FailoverRoute::new(vec![
            a.clone() as RouteHandlePtr,
            b.clone() as RouteHandlePtr,
            c.clone() as RouteHandlePtr,
        ]);

        let reply = route.route(&Request::get("k")).await;
        assert_eq!(reply.result, ResultCode::NotFound);
        assert_eq!(a.seen.borrow().len(), 1);
        assert_eq!(b.seen.borrow().len(), 1);
        assert!(c.seen.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_failover_returns_last_error() {
        let a = Fixed::new(ResultCode::Tko);
        let b = Fixed::new(ResultCode::ConnectError);
        let route = FailoverRoute::new(vec![a as RouteHandlePtr, b as RouteHandlePtr]);
        assert_eq!(
            route.route(&Request::get("k")).await.result,
            ResultCode::ConnectError
        );
    }

    #[tokio::test]
    async fn test_hash_route_is_stable() {
        let children: Vec<Rc<Fixed>> = (0..4).map(|_| Fixed::new(ResultCode::Found)).collect();
        let route = HashRoute::new(
            children.iter().map(|c| c.clone() as RouteHandlePtr).collect(),
            false,
        );

        for _ in 0..3 {
            route.route(&Request::get("user:1")).await;
        }
        let idx = route.pick("user:1").unwrap();
        assert_eq!(children[idx].seen.borrow().len(), 3);
        let total: usize = children.iter().map(|c| c.seen.borrow().len()).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_hash_route_fails_over_to_next_child() {
        let children = vec![Fixed::new(ResultCode::Tko), Fixed::new(ResultCode::Tko)];
        let route = HashRoute::new(
            children.iter().map(|c| c.clone() as RouteHandlePtr).collect(),
            true,
        );
        let reply = route.route(&Request::get("k")).await;
        assert_eq!(reply.result, ResultCode::Tko);
        assert_eq!(children[0].seen.borrow().len(), 1);
        assert_eq!(children[1].seen.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_routes_reply_local_error() {
        assert_eq!(
            HashRoute::new(Vec::new(), true)
                .route(&Request::get("k"))
                .await
                .result,
            ResultCode::LocalError
        );
        assert_eq!(
            ProxyConfig::unconfigured()
                .root()
                .route(&Request::get("k"))
                .await
                .result,
            ResultCode::LocalError
        );
    }
}
