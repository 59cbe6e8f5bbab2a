//! Process plugins: per-flow protocol parsers hooked into the packet path.
//!
//! A plugin registers for lifecycle hooks and may attach one opaque
//! [`Extension`] per flow, identified by a process-wide [`ExtensionId`].
//! Hook return codes drive the cache: a plugin can veto flow creation,
//! request immediate export, or flush a flow and have the triggering packet
//! re-routed as if the flow never existed.
//!
//! Dispatch is a vtable indirection per hook over a registration-ordered
//! vector of plugin handles; later plugins observe the effects of earlier
//! ones.

pub mod dns;
pub mod http;

use std::any::Any;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::cache::record::{FlowRecord, TerminationReason};
use crate::packet::Packet;

/// Process-wide identifier of an extension type.
///
/// Ids are allocated once at startup through [`register_extension`] and are
/// never reused; at most one extension per id may be attached to a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ExtensionId(pub u16);

static NEXT_EXTENSION_ID: AtomicU16 = AtomicU16::new(0);

/// Allocates a fresh extension id. Call once per extension type, at startup,
/// before capture begins.
pub fn register_extension() -> ExtensionId {
    ExtensionId(NEXT_EXTENSION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Parser-owned opaque state attached to a flow record.
///
/// The cache only owns the extension's lifetime (it is dropped with the
/// record); plugins create, mutate and serialise it through downcasting.
pub trait Extension: Any + Debug + Send {
    /// The registered id of this extension type.
    fn id(&self) -> ExtensionId;
    /// Upcast for typed read access.
    fn as_any(&self) -> &dyn Any;
    /// Upcast for typed write access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Hook return codes, ordered by strength.
///
/// When several plugins run on one hook, every plugin runs and the strongest
/// code wins. Codes outside a hook's contract (`Decline` outside
/// `pre_create`, `Flush*` outside `pre_update`) are treated as `Continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParserAction {
    /// Proceed normally.
    Continue,
    /// `pre_create` only: veto creation, drop the packet.
    Decline,
    /// Terminate the flow with reason `ForcedEnd` once the hook completes.
    Export,
    /// `pre_update` only: terminate with `ForcedEnd`, discard the packet.
    Flush,
    /// `pre_update` only: terminate with `ForcedEnd`, then re-route the same
    /// packet through the miss path. Budget of one per packet; a second
    /// request degrades to [`ParserAction::Flush`].
    FlushWithReinsert,
}

/// A protocol parser participating in the flow lifecycle.
///
/// All hooks default to no-ops so a plugin implements only the hooks it
/// advertises. Hooks receive the flow and the packet and return a
/// [`ParserAction`] interpreted by the cache.
pub trait ProcessPlugin: Debug + Send {
    /// Short stable plugin name, used in logs.
    fn name(&self) -> &'static str;

    /// The extension id this plugin attaches, if any.
    fn extension_id(&self) -> Option<ExtensionId> {
        None
    }

    /// A fresh, zero-initialised extension owned by the flow thereafter.
    fn make_extension(&self) -> Option<Box<dyn Extension>> {
        None
    }

    /// Packet matched no flow; runs before the record is created.
    fn pre_create(&mut self, _pkt: &Packet<'_>) -> ParserAction {
        ParserAction::Continue
    }

    /// Runs immediately after a new flow is initialised.
    fn post_create(&mut self, _flow: &mut FlowRecord, _pkt: &Packet<'_>) -> ParserAction {
        ParserAction::Continue
    }

    /// Existing flow, before its statistics are updated.
    fn pre_update(&mut self, _flow: &mut FlowRecord, _pkt: &Packet<'_>) -> ParserAction {
        ParserAction::Continue
    }

    /// Existing flow, after its statistics were updated.
    fn post_update(&mut self, _flow: &mut FlowRecord, _pkt: &Packet<'_>) -> ParserAction {
        ParserAction::Continue
    }

    /// Flow is leaving the cache; last chance to finalise extension state.
    fn on_finish(&mut self, _flow: &mut FlowRecord, _reason: TerminationReason) {}
}

/// Registration-ordered plugin chain invoked by the cache at each hook.
#[derive(Default)]
pub struct ParserPipeline {
    plugins: Vec<Box<dyn ProcessPlugin>>,
}

impl Debug for ParserPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserPipeline")
            .field("plugins", &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ParserPipeline {
    /// Empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a plugin; hooks run in registration order.
    pub fn register(&mut self, plugin: Box<dyn ProcessPlugin>) {
        self.plugins.push(plugin);
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// True when no plugin is registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Every plugin runs; only the codes a hook contracts for are honoured,
    /// and the strongest of those wins.
    fn run_hook(
        plugins: &mut [Box<dyn ProcessPlugin>],
        honoured: fn(ParserAction) -> bool,
        mut invoke: impl FnMut(&mut dyn ProcessPlugin) -> ParserAction,
    ) -> ParserAction {
        let mut strongest = ParserAction::Continue;
        for plugin in plugins {
            let action = invoke(plugin.as_mut());
            if honoured(action) {
                strongest = strongest.max(action);
            }
        }
        strongest
    }

    pub(crate) fn pre_create(&mut self, pkt: &Packet<'_>) -> ParserAction {
        Self::run_hook(
            &mut self.plugins,
            |a| a == ParserAction::Decline,
            |p| p.pre_create(pkt),
        )
    }

    pub(crate) fn post_create(&mut self, flow: &mut FlowRecord, pkt: &Packet<'_>) -> ParserAction {
        Self::run_hook(
            &mut self.plugins,
            |a| a == ParserAction::Export,
            |p| p.post_create(flow, pkt),
        )
    }

    pub(crate) fn pre_update(&mut self, flow: &mut FlowRecord, pkt: &Packet<'_>) -> ParserAction {
        Self::run_hook(
            &mut self.plugins,
            |a| {
                matches!(
                    a,
                    ParserAction::Export | ParserAction::Flush | ParserAction::FlushWithReinsert
                )
            },
            |p| p.pre_update(flow, pkt),
        )
    }

    pub(crate) fn post_update(&mut self, flow: &mut FlowRecord, pkt: &Packet<'_>) -> ParserAction {
        Self::run_hook(
            &mut self.plugins,
            |a| a == ParserAction::Export,
            |p| p.post_update(flow, pkt),
        )
    }

    pub(crate) fn on_finish(&mut self, flow: &mut FlowRecord, reason: TerminationReason) {
        for plugin in &mut self.plugins {
            plugin.on_finish(flow, reason);
        }
    }
}
