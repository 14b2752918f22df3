//! Component tree.
//!
//! Components are heterogeneous emulated units (processors, screens, sound
//! chips, battery-backed memory). They live in an arena owned by the
//! session; the tree structure is kept as index edges next to it so that a
//! component can be borrowed mutably while the tree metadata is read.

use crate::error::{MachineError, Result, StartError, StartResult};
use crate::notify::{NotifierBus, NotifierMark, NotifyCallback, NotifyKind};
use crate::scheduler::{Scheduler, TimerCallback, TimerHandle, TimerTarget};
use crate::session::SessionHandle;
use crate::state::{StateItem, StateManager};
use crate::time::VirtualTime;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;

/// Index of a component in its [`ComponentTree`].
pub type ComponentId = usize;

/// Separator between path segments of a component tag.
pub const TAG_SEPARATOR: char = ':';

/// Access to the session granted to running components.
pub struct DeviceContext<'a> {
    pub scheduler: &'a mut dyn Scheduler,
    pub session: &'a SessionHandle,
}

impl<'a> DeviceContext<'a> {
    pub fn new(scheduler: &'a mut dyn Scheduler, session: &'a SessionHandle) -> Self {
        Self { scheduler, session }
    }

    pub fn now(&self) -> VirtualTime {
        self.scheduler.now()
    }
}

/// Lifecycle surface implemented by every emulated unit.
///
/// Only [`Component::start`] is mandatory in spirit; everything else
/// defaults to doing nothing.
pub trait Component {
    /// Acquire resources, register persisted state and resolve
    /// dependencies. Return [`StartError::MissingDependency`] when another
    /// component must be started first; the attempt is retried.
    fn start(&mut self, ctx: &mut StartContext<'_>) -> StartResult;

    fn reset(&mut self, _ctx: &mut DeviceContext<'_>) {}

    fn stop(&mut self, _ctx: &mut DeviceContext<'_>) {}

    fn pre_save(&mut self) {}

    fn post_load(&mut self) {}

    /// Whether the scheduler should hand this component execution budget.
    fn is_executing(&self) -> bool {
        false
    }

    /// Run for up to `budget` of virtual time.
    fn execute(&mut self, _budget: VirtualTime, _ctx: &mut DeviceContext<'_>) -> Result<()> {
        Ok(())
    }

    /// A timer allocated with [`StartContext::timer_alloc`] expired.
    fn timer_fired(&mut self, _timer: u32, _ctx: &mut DeviceContext<'_>) {}

    fn has_nvram(&self) -> bool {
        false
    }

    /// Restore non-volatile contents. `None` means no saved image exists
    /// and the component should apply its defaults.
    fn nvram_load(&mut self, _data: Option<&[u8]>) {}

    fn nvram_save(&self) -> Option<Vec<u8>> {
        None
    }

    fn config_load(&mut self, _value: &serde_json::Value) {}

    fn config_save(&self) -> Option<serde_json::Value> {
        None
    }
}

struct Node {
    tag: String,
    parent: Option<ComponentId>,
    children: Vec<ComponentId>,
    started: bool,
}

/// Arena of components plus their parent/child structure.
#[derive(Default)]
pub struct ComponentTree {
    nodes: Vec<Node>,
    components: Vec<Box<dyn Component>>,
    by_tag: HashMap<String, ComponentId>,
}

impl ComponentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `component` as a child of `parent` (or as a root).
    ///
    /// The tag is the parent's tag and `name` joined by `:`.
    pub fn add(
        &mut self,
        parent: Option<ComponentId>,
        name: &str,
        component: Box<dyn Component>,
    ) -> Result<ComponentId> {
        let tag = match parent {
            Some(p) => {
                let node = self
                    .nodes
                    .get(p)
                    .ok_or_else(|| MachineError::UnknownTag(format!("#{}", p)))?;
                format!("{}{}{}", node.tag, TAG_SEPARATOR, name)
            }
            None => name.to_string(),
        };
        if self.by_tag.contains_key(&tag) {
            return Err(MachineError::DuplicateTag(tag));
        }

        let id = self.nodes.len();
        if let Some(p) = parent {
            self.nodes[p].children.push(id);
        }
        self.by_tag.insert(tag.clone(), id);
        self.nodes.push(Node {
            tag,
            parent,
            children: Vec::new(),
            started: false,
        });
        self.components.push(component);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, tag: &str) -> Option<ComponentId> {
        self.by_tag.get(tag).copied()
    }

    pub fn tag(&self, id: ComponentId) -> &str {
        self.nodes.get(id).map(|n| n.tag.as_str()).unwrap_or("")
    }

    pub fn parent(&self, id: ComponentId) -> Option<ComponentId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: ComponentId) -> &[ComponentId] {
        self.nodes.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn is_started(&self, id: ComponentId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.started)
    }

    pub fn component(&self, id: ComponentId) -> Option<&dyn Component> {
        self.components.get(id).map(|c| c.as_ref())
    }

    pub fn component_mut(&mut self, id: ComponentId) -> Option<&mut (dyn Component + 'static)> {
        self.components.get_mut(id).map(|c| c.as_mut())
    }

    /// Preorder walk: each root in insertion order followed by its subtree.
    pub fn tree_order(&self) -> Vec<ComponentId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<ComponentId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(id, _)| id)
            .rev()
            .collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().rev());
        }
        order
    }

    /// Started components that want execution budget, in tree order.
    pub fn executing(&self) -> Vec<ComponentId> {
        self.tree_order()
            .into_iter()
            .filter(|&id| self.nodes[id].started && self.components[id].is_executing())
            .collect()
    }

    /// Run one activation attempt for `id`.
    ///
    /// State items, timers and notifiers registered by a failed attempt are
    /// released again.
    pub(crate) fn try_start(
        &mut self,
        id: ComponentId,
        scheduler: &mut dyn Scheduler,
        state: &mut StateManager,
        notifiers: &mut NotifierBus,
        session: &SessionHandle,
    ) -> StartResult {
        let notifier_mark = notifiers.mark();
        let mut ctx = StartContext {
            id,
            tag: &self.nodes[id].tag,
            nodes: &self.nodes,
            by_tag: &self.by_tag,
            scheduler,
            state,
            notifiers,
            session,
            notifier_mark,
            staged_items: Vec::new(),
            staged_timers: Vec::new(),
        };
        let result = self.components[id].start(&mut ctx);
        if result.is_err() {
            ctx.rollback();
        }
        if result.is_ok() {
            self.nodes[id].started = true;
        }
        result
    }

    pub fn reset_all(&mut self, ctx: &mut DeviceContext<'_>) {
        for id in self.tree_order() {
            log::trace!("[Tree] reset {}", self.nodes[id].tag);
            self.components[id].reset(ctx);
        }
    }

    /// Stop every component, children before their parents.
    pub fn stop_all(&mut self, ctx: &mut DeviceContext<'_>) {
        for id in self.tree_order().into_iter().rev() {
            log::trace!("[Tree] stop {}", self.nodes[id].tag);
            self.components[id].stop(ctx);
        }
    }

    pub fn pre_save_all(&mut self) {
        for id in self.tree_order() {
            self.components[id].pre_save();
        }
    }

    pub fn post_load_all(&mut self) {
        for id in self.tree_order() {
            self.components[id].post_load();
        }
    }
}

impl fmt::Debug for ComponentTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|n| (&n.tag, n.started)))
            .finish()
    }
}

/// Access granted to a component while it is being started.
pub struct StartContext<'a> {
    id: ComponentId,
    tag: &'a str,
    nodes: &'a [Node],
    by_tag: &'a HashMap<String, ComponentId>,
    pub scheduler: &'a mut dyn Scheduler,
    state: &'a mut StateManager,
    notifiers: &'a mut NotifierBus,
    pub session: &'a SessionHandle,
    notifier_mark: NotifierMark,
    staged_items: Vec<String>,
    staged_timers: Vec<TimerHandle>,
}

impl<'a> StartContext<'a> {
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// Full tag of the component being started.
    pub fn tag(&self) -> &str {
        self.tag
    }

    /// Resolve a tag relative to the tree root.
    ///
    /// Fails with a missing dependency while the target exists but has not
    /// started yet, and fatally when no such component was configured.
    pub fn require(&self, tag: &str) -> std::result::Result<ComponentId, StartError> {
        match self.by_tag.get(tag) {
            Some(&id) if self.nodes[id].started => Ok(id),
            Some(_) => Err(StartError::MissingDependency(tag.to_string())),
            None => Err(MachineError::UnknownTag(tag.to_string()).into()),
        }
    }

    pub fn is_started(&self, tag: &str) -> bool {
        self.by_tag
            .get(tag)
            .is_some_and(|&id| self.nodes[id].started)
    }

    /// Register `item` for persistence as `<tag>/<name>`.
    pub fn save_item<T>(&mut self, name: &str, item: &StateItem<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let full = format!("{}/{}", self.tag, name);
        self.state.register_item(full.clone(), item)?;
        self.staged_items.push(full);
        Ok(())
    }

    /// Allocate a timer whose expiry calls back into this component's
    /// [`Component::timer_fired`] with `timer`. Unnamed timers block saving
    /// while enabled.
    pub fn timer_alloc(&mut self, timer: u32, name: Option<&str>) -> TimerHandle {
        let name = name.map(|n| format!("{}/{}", self.tag, n));
        let handle = self.scheduler.timer_alloc(
            TimerTarget::Component { id: self.id, timer },
            name.as_deref(),
        );
        self.staged_timers.push(handle);
        handle
    }

    /// Allocate a timer that runs `callback` on expiry.
    pub fn callback_timer_alloc(&mut self, name: Option<&str>, callback: TimerCallback) -> TimerHandle {
        let name = name.map(|n| format!("{}/{}", self.tag, n));
        let handle = self
            .scheduler
            .timer_alloc(TimerTarget::Callback(callback), name.as_deref());
        self.staged_timers.push(handle);
        handle
    }

    /// Hook a lifecycle transition. Exit hooks run in reverse registration
    /// order, so a component's teardown runs before that of anything it
    /// depends on.
    pub fn add_notifier(&mut self, kind: NotifyKind, callback: NotifyCallback) -> Result<()> {
        self.notifiers.register(self.session.phase(), kind, callback)
    }

    fn rollback(&mut self) {
        self.notifiers.rollback(self.notifier_mark);
        for name in self.staged_items.drain(..) {
            self.state.unregister_item(&name);
        }
        for handle in self.staged_timers.drain(..) {
            self.scheduler.timer_free(handle);
        }
    }
}
