use crate::packet::RxPacket;
use crate::reset::ResetKind;
use crate::tx::TxQueueId;

/// The upstream network stack.
///
/// Called from channel poll context (receive, wake) and from the reset
/// worker (detach, attach, reset outcome). Implementations must not block.
pub trait NetStack: Send + Sync + 'static {
    /// Deliver one received packet, possibly aggregated from several frames.
    fn receive(&self, packet: RxPacket);

    /// A stopped transmit queue has room again.
    fn wake_queue(&self, queue: TxQueueId);

    /// The device is about to stop all queues. No transmits should be
    /// submitted until [`attach`](Self::attach).
    fn detach(&self) {}

    /// Queues are running again.
    fn attach(&self) {}

    /// A reset of `kind` finished; `recovered` is false when the device was
    /// disabled.
    fn reset_done(&self, _kind: ResetKind, _recovered: bool) {}
}
