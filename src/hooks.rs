//! Hook manager: keeps the compose surface and the send control wired.
//!
//! Element discovery belongs to the [`PlatformAdapter`]. The manager only
//! remembers which handles it wired, checks they are still connected before
//! trusting them, and re-wires the piece that went missing or changed.
//!
//! The registration lock is never held while calling into the adapter or an
//! element, so adapters may fire their callbacks synchronously.

use crate::controller::ProceedAction;
use crate::interceptor::SendInterceptor;
use futures::future::{self, BoxFuture};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

/// Invoked by the platform on a send gesture. Resolves to `true` when the
/// native action must be suppressed.
pub type ElementListener = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Receives the trimmed compose text for every send gesture.
pub type SendListener = Arc<dyn Fn(SendTrigger, String) -> BoxFuture<'static, bool> + Send + Sync>;

/// An element owned by the platform. The core never extends its lifetime
/// beyond holding a reference and asking whether it is still connected.
pub trait ElementHandle: Clone + Send + Sync + 'static {
    /// Stable for the lifetime of the underlying element.
    fn identity(&self) -> u64;
    fn is_connected(&self) -> bool;
    fn is_editable(&self) -> bool;
    fn text_content(&self) -> String;
    fn add_listener(&self, listener: ElementListener);
}

pub trait PlatformAdapter: Send + Sync + 'static {
    type Handle: ElementHandle;

    fn find_compose_surface(&self) -> Option<Self::Handle>;
    fn find_send_control(&self) -> Option<Self::Handle>;
    fn on_mutation(&self, callback: Box<dyn Fn() + Send + Sync>);
    fn on_focus_in(&self, callback: Box<dyn Fn(Self::Handle) + Send + Sync>);
}

/// Discovery strategies tried in rank order; the first hit wins.
pub struct MatcherChain<H> {
    strategies: Vec<(&'static str, Box<dyn Fn() -> Option<H> + Send + Sync>)>,
}

impl<H> Default for MatcherChain<H> {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }
}

impl<H> MatcherChain<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        name: &'static str,
        strategy: impl Fn() -> Option<H> + Send + Sync + 'static,
    ) -> Self {
        self.strategies.push((name, Box::new(strategy)));
        self
    }

    pub fn find(&self) -> Option<H> {
        self.strategies.iter().find_map(|(name, strategy)| {
            let found = strategy();
            if found.is_some() {
                debug!(strategy = *name, "Element matched");
            }
            found
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTrigger {
    EnterKey,
    SendButton,
}

struct Slot<H> {
    handle: Option<H>,
    /// Identity of the element that carries our listener.
    wired: Option<u64>,
    hooked: bool,
}

impl<H: ElementHandle> Slot<H> {
    fn new() -> Self {
        Self {
            handle: None,
            wired: None,
            hooked: false,
        }
    }

    /// Records what discovery found. Returns the handle when it still needs
    /// our listener.
    fn update(&mut self, found: Option<H>) -> Option<H> {
        let Some(handle) = found else {
            self.handle = None;
            self.hooked = false;
            return None;
        };

        let identity = handle.identity();
        let needs_listener = self.wired != Some(identity);
        if needs_listener {
            self.wired = Some(identity);
        }
        self.handle = Some(handle.clone());
        self.hooked = true;
        needs_listener.then_some(handle)
    }

    fn is_valid(&self) -> bool {
        self.hooked
            && self
                .handle
                .as_ref()
                .map(|handle| handle.is_connected())
                .unwrap_or(false)
    }
}

/// The weak association between the core and the platform's elements.
struct HookRegistration<H> {
    input: Slot<H>,
    send_control: Slot<H>,
}

pub struct HookManager<H: ElementHandle> {
    registration: Arc<Mutex<HookRegistration<H>>>,
    on_send: SendListener,
}

impl<H: ElementHandle> HookManager<H> {
    pub fn new(on_send: SendListener) -> Arc<Self> {
        Arc::new(Self {
            registration: Arc::new(Mutex::new(HookRegistration {
                input: Slot::new(),
                send_control: Slot::new(),
            })),
            on_send,
        })
    }

    /// Subscribes to the adapter's mutation and focus signals and does a
    /// first wiring pass.
    pub fn install<A>(self: &Arc<Self>, adapter: &Arc<A>)
    where
        A: PlatformAdapter<Handle = H>,
    {
        let manager = Arc::downgrade(self);
        let weak_adapter = Arc::downgrade(adapter);
        adapter.on_mutation(Box::new(move || {
            if let (Some(manager), Some(adapter)) = (manager.upgrade(), weak_adapter.upgrade()) {
                manager.ensure_hooked(adapter.as_ref());
            }
        }));

        let manager: Weak<Self> = Arc::downgrade(self);
        let weak_adapter = Arc::downgrade(adapter);
        adapter.on_focus_in(Box::new(move |focused: H| {
            if let (Some(manager), Some(adapter)) = (manager.upgrade(), weak_adapter.upgrade()) {
                manager.handle_focus(adapter.as_ref(), &focused);
            }
        }));

        self.ensure_hooked(adapter.as_ref());
    }

    /// Idempotent; safe to call on every mutation. Each pass asks the
    /// adapter again, so an element replaced by a different one is re-wired
    /// even while the old one is still connected.
    pub fn ensure_hooked<A>(&self, adapter: &A)
    where
        A: PlatformAdapter<Handle = H>,
    {
        let compose = adapter.find_compose_surface();
        let send_control = adapter.find_send_control();

        let to_wire = {
            let mut registration = self.lock();
            let input = registration.input.update(compose);
            let send = registration.send_control.update(send_control);
            [(input, SendTrigger::EnterKey), (send, SendTrigger::SendButton)]
        };

        for (handle, trigger) in to_wire {
            if let Some(handle) = handle {
                debug!(?trigger, element = handle.identity(), "Wiring element");
                handle.add_listener(self.listener(trigger));
            }
        }
    }

    /// Marks both slots unhooked until the next pass.
    pub fn invalidate(&self) {
        let mut registration = self.lock();
        registration.input.hooked = false;
        registration.send_control.hooked = false;
    }

    /// `(compose, send control)` wiring status.
    pub fn hooked(&self) -> (bool, bool) {
        let registration = self.lock();
        (
            registration.input.is_valid(),
            registration.send_control.is_valid(),
        )
    }

    fn handle_focus<A>(&self, adapter: &A, focused: &H)
    where
        A: PlatformAdapter<Handle = H>,
    {
        if !focused.is_editable() {
            return;
        }
        let known = self.lock().input.wired == Some(focused.identity());
        if !known {
            debug!(element = focused.identity(), "Focus moved to a new editable surface");
            self.invalidate();
            self.ensure_hooked(adapter);
        }
    }

    /// Reads the compose text at trigger time, from whichever compose
    /// surface is wired then.
    fn listener(&self, trigger: SendTrigger) -> ElementListener {
        let registration = Arc::downgrade(&self.registration);
        let on_send = self.on_send.clone();
        Box::new(move || -> BoxFuture<'static, bool> {
            let text = registration.upgrade().and_then(|registration| {
                let registration = registration.lock().unwrap_or_else(PoisonError::into_inner);
                let text = registration
                    .input
                    .handle
                    .as_ref()
                    .filter(|handle| handle.is_connected())
                    .map(|handle| handle.text_content().trim().to_string());
                text
            });
            match text {
                Some(text) => on_send(trigger, text),
                None => Box::pin(future::ready(false)),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, HookRegistration<H>> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Routes send gestures into `interceptor`; `native_send` performs the real
/// send when the interceptor lets it through later.
pub fn intercepting_listener(
    interceptor: SendInterceptor,
    native_send: Arc<dyn Fn() + Send + Sync>,
) -> SendListener {
    Arc::new(move |trigger: SendTrigger, text: String| -> BoxFuture<'static, bool> {
        let interceptor = interceptor.clone();
        let native_send = native_send.clone();
        Box::pin(async move {
            debug!(?trigger, "Send gesture");
            let proceed: ProceedAction = Box::new(move || native_send());
            interceptor.attempt_send(&text, proceed).await
        })
    })
}
