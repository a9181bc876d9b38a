//! Input and output slots.
//!
//! Slots are cheap handles (`Arc` inside). An operator owns the only
//! long-lived handles to its slots; everything else (downstream inputs,
//! signal listeners) refers back through weak references, so dropping an
//! operator tears its wiring down.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use super::metadata::{Metadata, Value};
use super::operator::{configure, Operator};
use super::signal::{Signal, SubscriptionId};
use crate::array::ArrayBuffer;
use crate::error::{FlowError, MetadataError};
use crate::request::{Request, RequestContext};
use crate::roi::Roi;

/// Readiness of an output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No metadata: unconnected inputs or a failed `setup_outputs`
    NotReady,
    /// Metadata is current
    Ready,
    /// Upstream data changed since metadata was last established
    Dirty,
}

// =============================================================================
// Metadata transitions
// =============================================================================

thread_local! {
    static RECONFIGURING: Cell<usize> = const { Cell::new(0) };
}

/// Marks a metadata transition running on this thread.
///
/// Dirty notifications sent while a guard is alive reach every listener, but
/// do not move slots to [`SlotState::Dirty`]: they announce new metadata,
/// not new data. Guards nest.
pub(crate) struct Reconfiguring(());

impl Reconfiguring {
    pub(crate) fn enter() -> Self {
        RECONFIGURING.with(|depth| depth.set(depth.get() + 1));
        Self(())
    }

    fn active() -> bool {
        RECONFIGURING.with(|depth| depth.get() > 0)
    }
}

impl Drop for Reconfiguring {
    fn drop(&mut self) {
        RECONFIGURING.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

// =============================================================================
// OutputSlot
// =============================================================================

/// Output endpoint of an operator.
///
/// Reading an output never caches: every [`get`](OutputSlot::get) creates a
/// fresh request that calls the owning operator's `execute`.
#[derive(Clone)]
pub struct OutputSlot {
    inner: Arc<OutputInner>,
}

struct OutputInner {
    name: String,
    operator: Weak<dyn Operator>,
    meta: RwLock<Option<Metadata>>,
    dirty_flag: RwLock<bool>,
    dirty: Signal<Roi>,
    meta_changed: Signal<()>,
}

impl OutputSlot {
    pub fn new(name: impl Into<String>, operator: &Weak<dyn Operator>) -> Self {
        Self {
            inner: Arc::new(OutputInner {
                name: name.into(),
                operator: operator.clone(),
                meta: RwLock::new(None),
                dirty_flag: RwLock::new(false),
                dirty: Signal::new(),
                meta_changed: Signal::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn meta(&self) -> Option<Metadata> {
        self.inner.meta.read().clone()
    }

    pub fn ready(&self) -> bool {
        self.inner.meta.read().is_some()
    }

    pub fn state(&self) -> SlotState {
        if !self.ready() {
            SlotState::NotReady
        } else if *self.inner.dirty_flag.read() {
            SlotState::Dirty
        } else {
            SlotState::Ready
        }
    }

    /// Replace the metadata. Called from `setup_outputs`; listeners are
    /// notified by [`configure`] once the whole operator has been set up.
    pub fn set_meta(&self, meta: Option<Metadata>) {
        *self.inner.meta.write() = meta;
    }

    pub(crate) fn mark_clean(&self) {
        *self.inner.dirty_flag.write() = false;
    }

    pub fn operator(&self) -> Result<Arc<dyn Operator>, FlowError> {
        self.inner
            .operator
            .upgrade()
            .ok_or_else(|| FlowError::OperatorDropped(self.inner.name.clone()))
    }

    pub fn ptr_eq(&self, other: &OutputSlot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Request the data in `roi` as a new root request.
    pub fn get(&self, roi: Roi) -> Request<ArrayBuffer> {
        let slot = self.clone();
        Request::new(move |ctx| async move { slot.compute(roi, ctx).await })
    }

    /// Request the data in `roi` as a child of the running request `ctx`.
    pub fn get_within(&self, ctx: &RequestContext, roi: Roi) -> Request<ArrayBuffer> {
        let slot = self.clone();
        ctx.child(move |ctx| async move { slot.compute(roi, ctx).await })
    }

    /// Request the whole array.
    pub fn get_all(&self) -> Request<ArrayBuffer> {
        match self.meta() {
            Some(meta) => self.get(meta.roi()),
            None => Request::failed(self.not_ready()),
        }
    }

    async fn compute(&self, roi: Roi, ctx: RequestContext) -> Result<ArrayBuffer, FlowError> {
        ctx.check_cancelled()?;
        let meta = self.meta().ok_or_else(|| self.not_ready())?;
        roi.check_bounds(&meta.shape)?;
        let operator = self.operator()?;

        let started = Instant::now();
        let result = operator.execute(self, &roi, &ctx).await?;
        if result.shape() != roi.shape().as_slice() || result.dtype() != meta.dtype {
            return Err(FlowError::compute(
                operator.name(),
                format!(
                    "execute returned {:?} {} for region {} (expected {:?} {})",
                    result.shape(),
                    result.dtype(),
                    roi,
                    roi.shape(),
                    meta.dtype
                ),
            ));
        }
        trace!(
            operator = operator.name(),
            slot = self.name(),
            roi = %roi,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Computed region"
        );
        Ok(result)
    }

    fn not_ready(&self) -> FlowError {
        FlowError::NotReady {
            slot: self.inner.name.clone(),
        }
    }

    /// Announce that the data in `roi` changed. Ignored while not ready.
    ///
    /// The slot reports [`SlotState::Dirty`] until its operator is next
    /// configured, unless the notification is part of a metadata transition.
    pub fn set_dirty(&self, roi: &Roi) {
        if !self.ready() {
            return;
        }
        if !Reconfiguring::active() {
            *self.inner.dirty_flag.write() = true;
        }
        self.inner.dirty.emit(roi);
    }

    pub fn set_dirty_all(&self) {
        if let Some(meta) = self.meta() {
            self.set_dirty(&meta.roi());
        }
    }

    /// Register a dirty listener. Listeners receive the changed region.
    pub fn notify_dirty(&self, listener: impl Fn(&Roi) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.dirty.subscribe(listener)
    }

    pub fn unregister_dirty(&self, id: SubscriptionId) -> bool {
        self.inner.dirty.unsubscribe(id)
    }

    pub fn notify_meta_changed(&self, listener: impl Fn(&()) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.meta_changed.subscribe(listener)
    }

    pub fn unregister_meta_changed(&self, id: SubscriptionId) -> bool {
        self.inner.meta_changed.unsubscribe(id)
    }

    pub(crate) fn emit_meta_changed(&self) {
        self.inner.meta_changed.emit(&());
    }

    /// Number of registered dirty listeners.
    pub fn dirty_listener_count(&self) -> usize {
        self.inner.dirty.len()
    }
}

impl std::fmt::Debug for OutputSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSlot")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// InputSlot
// =============================================================================

/// Input endpoint of an operator.
///
/// An input is either empty, fed a [`Value`] directly, or connected to an
/// upstream [`OutputSlot`]. Connecting subscribes to the upstream's dirty and
/// meta-changed signals; the subscriptions are removed on disconnect and when
/// the owning operator is dropped.
#[derive(Clone)]
pub struct InputSlot {
    inner: Arc<InputInner>,
}

struct InputInner {
    name: String,
    operator: Weak<dyn Operator>,
    optional: bool,
    default: Option<Value>,
    source: Mutex<Source>,
}

enum Source {
    Empty,
    Value(Value),
    Connected {
        upstream: OutputSlot,
        dirty_sub: SubscriptionId,
        meta_sub: SubscriptionId,
    },
}

impl Source {
    fn release(self) {
        if let Source::Connected {
            upstream,
            dirty_sub,
            meta_sub,
        } = self
        {
            upstream.unregister_dirty(dirty_sub);
            upstream.unregister_meta_changed(meta_sub);
        }
    }
}

impl Drop for InputInner {
    fn drop(&mut self) {
        std::mem::replace(self.source.get_mut(), Source::Empty).release();
    }
}

impl InputSlot {
    /// A required input.
    pub fn new(name: impl Into<String>, operator: &Weak<dyn Operator>) -> Self {
        Self::build(name.into(), operator, false, None)
    }

    /// An input that does not block `setup_outputs` while empty.
    pub fn optional(name: impl Into<String>, operator: &Weak<dyn Operator>) -> Self {
        Self::build(name.into(), operator, true, None)
    }

    /// An input that reads as `default` until something else is set.
    pub fn with_default(
        name: impl Into<String>,
        operator: &Weak<dyn Operator>,
        default: impl Into<Value>,
    ) -> Self {
        Self::build(name.into(), operator, false, Some(default.into()))
    }

    fn build(
        name: String,
        operator: &Weak<dyn Operator>,
        optional: bool,
        default: Option<Value>,
    ) -> Self {
        Self {
            inner: Arc::new(InputInner {
                name,
                operator: operator.clone(),
                optional,
                default,
                source: Mutex::new(Source::Empty),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_optional(&self) -> bool {
        self.inner.optional
    }

    /// True if both handles refer to the same slot.
    pub fn is(&self, other: &InputSlot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.source.lock(), Source::Connected { .. })
    }

    pub fn upstream(&self) -> Option<OutputSlot> {
        match &*self.inner.source.lock() {
            Source::Connected { upstream, .. } => Some(upstream.clone()),
            _ => None,
        }
    }

    /// True if the slot has a value, a default, or a ready upstream.
    pub fn ready(&self) -> bool {
        match &*self.inner.source.lock() {
            Source::Empty => self.inner.default.is_some(),
            Source::Value(_) => true,
            Source::Connected { upstream, .. } => upstream.ready(),
        }
    }

    /// Directly set value, or the default. `None` when connected.
    pub fn value(&self) -> Option<Value> {
        match &*self.inner.source.lock() {
            Source::Empty => self.inner.default.clone(),
            Source::Value(value) => Some(value.clone()),
            Source::Connected { .. } => None,
        }
    }

    /// Metadata of the upstream, or of an array value.
    pub fn meta(&self) -> Option<Metadata> {
        match &*self.inner.source.lock() {
            Source::Empty => self.inner.default.as_ref().and_then(Value::meta),
            Source::Value(value) => value.meta(),
            Source::Connected { upstream, .. } => upstream.meta(),
        }
    }

    /// Metadata, or a `MetadataError` naming this slot and its operator.
    pub fn require_meta(&self) -> Result<Metadata, MetadataError> {
        self.meta().ok_or_else(|| self.not_ready_error())
    }

    /// Value as a shape, or an error naming this slot.
    pub fn require_shape(&self) -> Result<Vec<usize>, MetadataError> {
        let value = self.value().ok_or_else(|| self.not_ready_error())?;
        value
            .as_shape()
            .map(<[usize]>::to_vec)
            .ok_or_else(|| MetadataError::UnexpectedValue {
                slot: self.name().to_string(),
                expected: "shape",
                actual: value.kind().to_string(),
            })
    }

    /// Value as a bool, or an error naming this slot.
    pub fn require_bool(&self) -> Result<bool, MetadataError> {
        let value = self.value().ok_or_else(|| self.not_ready_error())?;
        value.as_bool().ok_or_else(|| MetadataError::UnexpectedValue {
            slot: self.name().to_string(),
            expected: "bool",
            actual: value.kind().to_string(),
        })
    }

    /// Value as a float (ints are widened), or an error naming this slot.
    pub fn require_float(&self) -> Result<f64, MetadataError> {
        let value = self.value().ok_or_else(|| self.not_ready_error())?;
        value.as_float().ok_or_else(|| MetadataError::UnexpectedValue {
            slot: self.name().to_string(),
            expected: "float",
            actual: value.kind().to_string(),
        })
    }

    fn not_ready_error(&self) -> MetadataError {
        MetadataError::InputNotReady {
            operator: self.operator_name(),
            slot: self.name().to_string(),
        }
    }

    fn operator_name(&self) -> String {
        self.inner
            .operator
            .upgrade()
            .map(|op| op.name().to_string())
            .unwrap_or_else(|| "<dropped>".to_string())
    }

    /// Region covering the whole input.
    pub fn full_roi(&self) -> Roi {
        self.meta().map(|m| m.roi()).unwrap_or_else(Roi::scalar)
    }

    /// Connect to `upstream`.
    ///
    /// Re-connecting to the current upstream is a no-op. Any previous
    /// connection or value is dropped first, so the slot never holds two
    /// subscriptions. Fails without changing anything if the connection
    /// would close a cycle.
    pub fn connect(&self, upstream: &OutputSlot) -> Result<(), MetadataError> {
        if let Some(current) = self.upstream() {
            if current.ptr_eq(upstream) {
                return Ok(());
            }
        }
        self.check_cycle(upstream)?;

        let dirty_sub = {
            let weak = Arc::downgrade(&self.inner);
            upstream.notify_dirty(move |roi| {
                if let Some(inner) = weak.upgrade() {
                    InputSlot { inner }.on_upstream_dirty(roi);
                }
            })
        };
        let meta_sub = {
            let weak = Arc::downgrade(&self.inner);
            upstream.notify_meta_changed(move |_| {
                if let Some(inner) = weak.upgrade() {
                    InputSlot { inner }.on_upstream_meta_changed();
                }
            })
        };

        let previous = std::mem::replace(
            &mut *self.inner.source.lock(),
            Source::Connected {
                upstream: upstream.clone(),
                dirty_sub,
                meta_sub,
            },
        );
        previous.release();
        self.changed()
    }

    /// Drop the connection or value and reconfigure the operator.
    pub fn disconnect(&self) -> Result<(), MetadataError> {
        let previous = std::mem::replace(&mut *self.inner.source.lock(), Source::Empty);
        let was_set = !matches!(previous, Source::Empty);
        previous.release();
        if was_set {
            self.changed()
        } else {
            Ok(())
        }
    }

    /// Feed a value directly, replacing any connection.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<(), MetadataError> {
        let previous = std::mem::replace(&mut *self.inner.source.lock(), Source::Value(value.into()));
        previous.release();
        self.changed()
    }

    /// Request `roi` of this input's data as a root request.
    pub fn get(&self, roi: Roi) -> Request<ArrayBuffer> {
        match self.upstream() {
            Some(upstream) => upstream.get(roi),
            None => self.get_from_value(&roi),
        }
    }

    /// Request `roi` of this input's data as a child of `ctx`.
    pub fn get_within(&self, ctx: &RequestContext, roi: Roi) -> Request<ArrayBuffer> {
        match self.upstream() {
            Some(upstream) => upstream.get_within(ctx, roi),
            None => self.get_from_value(&roi),
        }
    }

    fn get_from_value(&self, roi: &Roi) -> Request<ArrayBuffer> {
        let Some(value) = self.value() else {
            return Request::failed(FlowError::NotReady {
                slot: self.name().to_string(),
            });
        };
        let Some(array) = value.as_array() else {
            return Request::failed(
                MetadataError::UnexpectedValue {
                    slot: self.name().to_string(),
                    expected: "array",
                    actual: value.kind().to_string(),
                }
                .into(),
            );
        };
        match roi.check_bounds(array.shape()) {
            Ok(()) => match array.extract(roi) {
                Ok(data) => Request::ready(data),
                Err(err) => Request::failed(err.into()),
            },
            Err(err) => Request::failed(err.into()),
        }
    }

    /// Reconfigure the owning operator and report the whole input dirty.
    fn changed(&self) -> Result<(), MetadataError> {
        let Some(operator) = self.inner.operator.upgrade() else {
            return Ok(());
        };
        let _transition = Reconfiguring::enter();
        configure(operator.as_ref())?;
        if self.ready() {
            operator.propagate_dirty(self, &self.full_roi());
        }
        Ok(())
    }

    fn on_upstream_dirty(&self, roi: &Roi) {
        if let Some(operator) = self.inner.operator.upgrade() {
            operator.propagate_dirty(self, roi);
        }
    }

    fn on_upstream_meta_changed(&self) {
        if let Some(operator) = self.inner.operator.upgrade() {
            if let Err(err) = configure(operator.as_ref()) {
                warn!(
                    operator = operator.name(),
                    slot = self.name(),
                    error = %err,
                    "Reconfiguration after upstream change failed"
                );
            }
        }
    }

    /// Walk upstream from `upstream` looking for this slot's operator.
    fn check_cycle(&self, upstream: &OutputSlot) -> Result<(), MetadataError> {
        let Some(own) = self.inner.operator.upgrade() else {
            return Ok(());
        };
        let target = Arc::as_ptr(&own) as *const ();

        let mut visited = HashSet::new();
        let mut stack: Vec<Arc<dyn Operator>> = upstream.operator().into_iter().collect();
        while let Some(operator) = stack.pop() {
            let ptr = Arc::as_ptr(&operator) as *const ();
            if ptr == target {
                return Err(MetadataError::Cycle {
                    operator: own.name().to_string(),
                    slot: self.name().to_string(),
                });
            }
            if !visited.insert(ptr) {
                continue;
            }
            for input in operator.inputs() {
                if let Some(next) = input.upstream().and_then(|up| up.operator().ok()) {
                    stack.push(next);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for InputSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSlot")
            .field("name", &self.inner.name)
            .field("connected", &self.is_connected())
            .field("ready", &self.ready())
            .finish()
    }
}
