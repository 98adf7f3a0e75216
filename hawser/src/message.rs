use std::any::Any;

use hawser_buffer::ByteBuf;
use log::warn;

/// A message travelling through a pipeline.
///
/// Handlers transform messages from one concrete type to another, so the
/// pipeline itself carries them type-erased; a handler that cares about a
/// specific type downcasts (or uses the typed adapter, which does it for
/// you).
pub type Message = Box<dyn Any + Send>;

/// Releases `msg` if it is a reference-counted buffer.
///
/// Returns `true` when the message was refcounted (whether or not the
/// release succeeded); a failed release is logged, not propagated, because
/// this runs on cleanup paths that must not fail.
pub fn release_refcounted(msg: &dyn Any) -> bool {
    if let Some(buf) = msg.downcast_ref::<ByteBuf>() {
        if let Err(err) = buf.release() {
            warn!("failed to release a buffer on a cleanup path: {}", err);
        }
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hawser_buffer::{BufferAllocator, UnpooledAllocator};

    #[test]
    fn buffers_are_released_other_messages_ignored() {
        let buf = UnpooledAllocator.heap_buffer(8).unwrap();
        let msg: Message = Box::new(buf);
        assert!(release_refcounted(msg.as_ref()));
        let msg: Message = Box::new("plain string".to_owned());
        assert!(!release_refcounted(msg.as_ref()));
    }
}
