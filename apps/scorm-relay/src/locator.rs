//! The "API hunt": finding the tracking runtime somewhere above (or beside)
//! the current window.
//!
//! Windows are never owned here. The search runs over a [`WindowAccessor`]
//! capability so any graph (browser handles, test fixtures, cycles) can be
//! walked with the same bounded procedure.

use std::{fmt, sync::Arc};

use thiserror::Error;
use tracing::debug;

use crate::tracking::TrackingApi;

/// Windows examined per chain, the start of the chain counting as level 1.
pub const MAX_HUNT_DEPTH: usize = 10;

/// Global names a host may bind the runtime under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiGlobal {
    Scorm12,
    Scorm2004,
}

impl ApiGlobal {
    /// Lookup order at every level.
    pub const ALL: [ApiGlobal; 2] = [ApiGlobal::Scorm12, ApiGlobal::Scorm2004];

    pub fn name(&self) -> &'static str {
        match self {
            ApiGlobal::Scorm12 => "API",
            ApiGlobal::Scorm2004 => "API_1484_11",
        }
    }
}

/// Read-only view over a window graph.
pub trait WindowAccessor {
    type Window: Clone + PartialEq;

    /// Containing window. Top-level windows report themselves or `None`.
    fn parent(&self, window: &Self::Window) -> Option<Self::Window>;
    fn opener(&self, window: &Self::Window) -> Option<Self::Window>;
    fn global(&self, window: &Self::Window, name: ApiGlobal) -> Option<Arc<dyn TrackingApi>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuntPhase {
    Ancestors,
    Opener,
}

#[derive(Clone)]
pub struct LocatedApi {
    pub api: Arc<dyn TrackingApi>,
    pub global: ApiGlobal,
    pub phase: HuntPhase,
    pub level: usize,
}

impl fmt::Debug for LocatedApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocatedApi")
            .field("global", &self.global.name())
            .field("phase", &self.phase)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LocateError {
    #[error("no tracking API reachable from this window")]
    NotFound,
}

/// Ancestors of `start` first, then the ancestors of its opener. First hit wins.
pub fn locate<A: WindowAccessor>(accessor: &A, start: &A::Window) -> Result<LocatedApi, LocateError> {
    debug!("starting API hunt");
    if let Some(found) = walk_chain(accessor, start.clone(), HuntPhase::Ancestors) {
        return Ok(found);
    }

    if let Some(opener) = accessor.opener(start) {
        if opener != *start {
            debug!("checking opener chain");
            if let Some(found) = walk_chain(accessor, opener, HuntPhase::Opener) {
                return Ok(found);
            }
        }
    }

    debug!("API hunt complete, no tracking API found");
    Err(LocateError::NotFound)
}

fn walk_chain<A: WindowAccessor>(
    accessor: &A,
    from: A::Window,
    phase: HuntPhase,
) -> Option<LocatedApi> {
    let mut current = from;
    for level in 1..=MAX_HUNT_DEPTH {
        for global in ApiGlobal::ALL {
            if let Some(api) = accessor.global(&current, global) {
                debug!(level, global = global.name(), ?phase, "found tracking API");
                return Some(LocatedApi {
                    api,
                    global,
                    phase,
                    level,
                });
            }
        }
        match accessor.parent(&current) {
            Some(parent) if parent != current => current = parent,
            _ => {
                debug!(level, ?phase, "reached top of window chain");
                break;
            }
        }
    }
    None
}

/// Source of the tracking runtime for a session.
pub trait ApiDiscovery: Send {
    fn discover(&self) -> Result<LocatedApi, LocateError>;
}

/// Discovery by hunting from a fixed start window.
pub struct WindowChainDiscovery<A: WindowAccessor> {
    accessor: A,
    start: A::Window,
}

impl<A: WindowAccessor> WindowChainDiscovery<A> {
    pub fn new(accessor: A, start: A::Window) -> Self {
        Self { accessor, start }
    }
}

impl<A> ApiDiscovery for WindowChainDiscovery<A>
where
    A: WindowAccessor + Send,
    A::Window: Send,
{
    fn discover(&self) -> Result<LocatedApi, LocateError> {
        locate(&self.accessor, &self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(usize);

#[derive(Default, Clone)]
struct WindowNode {
    parent: Option<WindowId>,
    opener: Option<WindowId>,
    globals: Vec<(ApiGlobal, Arc<dyn TrackingApi>)>,
}

/// Arena-backed window graph. Holds the strong references to installed
/// runtimes, the way a host page owns its globals.
#[derive(Default, Clone)]
pub struct WindowGraph {
    nodes: Vec<WindowNode>,
}

impl WindowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a top-level window whose parent is itself.
    pub fn add_top(&mut self) -> WindowId {
        let id = WindowId(self.nodes.len());
        self.nodes.push(WindowNode {
            parent: Some(id),
            ..WindowNode::default()
        });
        id
    }

    pub fn add_child(&mut self, parent: WindowId) -> WindowId {
        let id = WindowId(self.nodes.len());
        self.nodes.push(WindowNode {
            parent: Some(parent),
            ..WindowNode::default()
        });
        id
    }

    /// Builds `depth` windows, each nested in the previous one, and returns
    /// them outermost first.
    pub fn add_nested_chain(&mut self, depth: usize) -> Vec<WindowId> {
        let mut chain = Vec::with_capacity(depth);
        for _ in 0..depth {
            let id = match chain.last() {
                Some(parent) => self.add_child(*parent),
                None => self.add_top(),
            };
            chain.push(id);
        }
        chain
    }

    pub fn set_parent(&mut self, window: WindowId, parent: Option<WindowId>) {
        if let Some(node) = self.nodes.get_mut(window.0) {
            node.parent = parent;
        }
    }

    pub fn set_opener(&mut self, window: WindowId, opener: WindowId) {
        if let Some(node) = self.nodes.get_mut(window.0) {
            node.opener = Some(opener);
        }
    }

    pub fn install(&mut self, window: WindowId, name: ApiGlobal, api: Arc<dyn TrackingApi>) {
        if let Some(node) = self.nodes.get_mut(window.0) {
            node.globals.retain(|(existing, _)| *existing != name);
            node.globals.push((name, api));
        }
    }
}

impl WindowAccessor for WindowGraph {
    type Window = WindowId;

    fn parent(&self, window: &WindowId) -> Option<WindowId> {
        self.nodes.get(window.0).and_then(|node| node.parent)
    }

    fn opener(&self, window: &WindowId) -> Option<WindowId> {
        self.nodes.get(window.0).and_then(|node| node.opener)
    }

    fn global(&self, window: &WindowId, name: ApiGlobal) -> Option<Arc<dyn TrackingApi>> {
        self.nodes.get(window.0).and_then(|node| {
            node.globals
                .iter()
                .find(|(global, _)| *global == name)
                .map(|(_, api)| Arc::clone(api))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingTrackingApi;

    fn runtime() -> Arc<dyn TrackingApi> {
        Arc::new(RecordingTrackingApi::new())
    }

    /// Chain of `depth` windows, start window innermost.
    fn chain(depth: usize) -> (WindowGraph, Vec<WindowId>) {
        let mut graph = WindowGraph::new();
        let mut windows = graph.add_nested_chain(depth);
        windows.reverse();
        (graph, windows)
    }

    #[test]
    fn api_within_depth_bound_is_found() {
        let (mut graph, windows) = chain(12);
        graph.install(windows[9], ApiGlobal::Scorm12, runtime());
        let found = locate(&graph, &windows[0]).expect("found");
        assert_eq!(found.level, 10);
        assert_eq!(found.phase, HuntPhase::Ancestors);
    }

    #[test]
    fn api_beyond_depth_bound_is_not_found() {
        let (mut graph, windows) = chain(12);
        graph.install(windows[10], ApiGlobal::Scorm12, runtime());
        assert_eq!(locate(&graph, &windows[0]).unwrap_err(), LocateError::NotFound);
    }

    #[test]
    fn scorm12_binding_wins_at_same_level() {
        let (mut graph, windows) = chain(3);
        let newer = runtime();
        let older = runtime();
        graph.install(windows[1], ApiGlobal::Scorm2004, newer);
        graph.install(windows[1], ApiGlobal::Scorm12, Arc::clone(&older));
        let found = locate(&graph, &windows[0]).expect("found");
        assert_eq!(found.global, ApiGlobal::Scorm12);
        assert!(Arc::ptr_eq(&found.api, &older));
    }

    #[test]
    fn scorm2004_binding_is_found() {
        let (mut graph, windows) = chain(2);
        graph.install(windows[1], ApiGlobal::Scorm2004, runtime());
        let found = locate(&graph, &windows[0]).expect("found");
        assert_eq!(found.global, ApiGlobal::Scorm2004);
        assert_eq!(found.level, 2);
    }

    #[test]
    fn ancestors_take_priority_over_opener() {
        let mut graph = WindowGraph::new();
        let lms = graph.add_top();
        let popup = graph.add_top();
        graph.set_opener(popup, lms);
        graph.install(lms, ApiGlobal::Scorm12, runtime());
        graph.install(popup, ApiGlobal::Scorm2004, runtime());

        let found = locate(&graph, &popup).expect("found");
        assert_eq!(found.phase, HuntPhase::Ancestors);
        assert_eq!(found.global, ApiGlobal::Scorm2004);
    }

    #[test]
    fn opener_chain_is_searched_with_fresh_depth() {
        let mut graph = WindowGraph::new();
        let opener_chain = graph.add_nested_chain(10);
        graph.install(opener_chain[0], ApiGlobal::Scorm12, runtime());
        let popup_chain = graph.add_nested_chain(10);
        let start = popup_chain[9];
        graph.set_opener(start, opener_chain[9]);

        let found = locate(&graph, &start).expect("found");
        assert_eq!(found.phase, HuntPhase::Opener);
        assert_eq!(found.level, 10);
    }

    #[test]
    fn self_referential_opener_is_ignored() {
        let mut graph = WindowGraph::new();
        let top = graph.add_top();
        graph.set_opener(top, top);
        assert_eq!(locate(&graph, &top).unwrap_err(), LocateError::NotFound);
    }

    #[test]
    fn cyclic_parents_terminate() {
        let mut graph = WindowGraph::new();
        let a = graph.add_top();
        let b = graph.add_child(a);
        graph.set_parent(a, Some(b));
        assert_eq!(locate(&graph, &b).unwrap_err(), LocateError::NotFound);
    }

    #[test]
    fn orphan_window_without_parent_is_top() {
        let mut graph = WindowGraph::new();
        let lone = graph.add_top();
        graph.set_parent(lone, None);
        graph.install(lone, ApiGlobal::Scorm12, runtime());
        assert_eq!(locate(&graph, &lone).expect("found").level, 1);
    }
}
