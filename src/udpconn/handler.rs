use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::netmsg::Message;
use crate::udpconn::{PacketFlags, Stream};


/// Receives decoded messages. Returning `true` claims the message, so that no further handler
///  sees it.
///
/// Handlers run on the port's receive loop: they may send, but must not wait for
///  acknowledgements, since acks are processed by that same loop.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, stream: &Stream, msg: &dyn Message, flags: PacketFlags) -> bool;
}

struct FnHandler<F>(F);

#[async_trait]
impl <F> MessageHandler for FnHandler<F>
where F: Fn(&Stream, &dyn Message, PacketFlags) -> bool + Send + Sync + 'static
{
    async fn on_message(&self, stream: &Stream, msg: &dyn Message, flags: PacketFlags) -> bool {
        (self.0)(stream, msg, flags)
    }
}

/// Wraps a synchronous closure as a [MessageHandler].
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where F: Fn(&Stream, &dyn Message, PacketFlags) -> bool + Send + Sync + 'static
{
    Arc::new(FnHandler(f))
}


/// Handlers in registration order.
#[derive(Default)]
pub struct HandlerList {
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerList {
    pub fn add(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    fn snapshot(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Offers the message to each handler until one claims it.
    pub async fn call(&self, stream: &Stream, msg: &dyn Message, flags: PacketFlags) -> bool {
        for handler in self.snapshot() {
            if handler.on_message(stream, msg, flags).await {
                return true;
            }
        }
        false
    }
}
