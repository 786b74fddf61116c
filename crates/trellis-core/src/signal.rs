//! Request-level shutdown signal.
//!
//! The lifecycle controller owns one `watch` channel of [`ShutdownNotice`]
//! for the whole application. Every request context holds a receiver for
//! it plus a lazily created local channel, so a request is "done" when the
//! application starts shutting down or when the request itself is
//! cancelled.

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::error::Error;
use crate::handler::BoxFuture;

/// What the lifecycle controller broadcasts to in-flight requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownNotice {
    /// Shutdown has started.
    pub fired: bool,
    /// Deadline propagated from the shutdown's request context.
    pub deadline: Option<Instant>,
}

/// Sending half of the application-wide notice channel.
pub type NoticeSender = watch::Sender<ShutdownNotice>;

/// Receiving half of the application-wide notice channel.
pub type NoticeReceiver = watch::Receiver<ShutdownNotice>;

/// Creates the application-wide notice channel.
#[must_use]
pub fn notice_channel() -> (NoticeSender, NoticeReceiver) {
    watch::channel(ShutdownNotice::default())
}

/// Per-request view of the shutdown signal.
#[derive(Debug, Default)]
pub struct RequestSignal {
    notice: Option<NoticeReceiver>,
    local: Option<Arc<watch::Sender<bool>>>,
}

impl RequestSignal {
    /// Binds the signal to the application channel for a new request.
    pub fn bind(&mut self, notice: Option<NoticeReceiver>) {
        self.notice = notice;
        self.local = None;
    }

    /// Drops every channel handle.
    pub fn clear(&mut self) {
        self.notice = None;
        self.local = None;
    }

    fn local(&mut self) -> &Arc<watch::Sender<bool>> {
        self.local
            .get_or_insert_with(|| Arc::new(watch::channel(false).0))
    }

    /// Returns the completion handle. Repeated calls for the same request
    /// share one channel.
    pub fn done(&mut self) -> Done {
        let origin = Arc::clone(self.local());
        Done {
            notice: self.notice.clone(),
            local: origin.subscribe(),
            origin,
        }
    }

    /// Cancels this request only.
    pub fn cancel(&mut self) {
        self.local().send_replace(true);
    }

    /// Whether the application is shutting down or the request was
    /// cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.is_shutting_down() || self.local.as_ref().is_some_and(|l| *l.borrow())
    }

    /// Whether the application-wide notice has fired.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.notice.as_ref().is_some_and(|n| n.borrow().fired)
    }

    /// `None` before cancellation, [`Error::RequestShutdown`] after.
    #[must_use]
    pub fn err(&self) -> Option<Error> {
        self.is_done().then_some(Error::RequestShutdown)
    }

    /// The propagated deadline, if shutdown was given one.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.notice.as_ref().and_then(|n| n.borrow().deadline)
    }
}

/// Completes when the request is done.
///
/// Await it directly (`ctx.done().await`) or poll [`Done::is_done`].
#[derive(Debug, Clone)]
pub struct Done {
    notice: Option<NoticeReceiver>,
    local: watch::Receiver<bool>,
    origin: Arc<watch::Sender<bool>>,
}

impl Done {
    /// Non-blocking check.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.local.borrow() || self.notice.as_ref().is_some_and(|n| n.borrow().fired)
    }

    /// Whether both handles observe the same request channel.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.origin, &other.origin)
    }

    /// Waits until the request is done.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut local = self.local.clone();
        let notice = self.notice.clone();
        async move {
            let global = async move {
                match notice {
                    // A dropped sender means the application is gone.
                    Some(mut rx) => {
                        let _ = rx.wait_for(|n| n.fired).await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = local.wait_for(|cancelled| *cancelled) => {}
                () = global => {}
            }
        }
    }
}

impl IntoFuture for Done {
    type Output = ();
    type IntoFuture = BoxFuture<'static, ()>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
