//! 审计/通知事件接收端
//!
//! 发后即忘：中枢把事件投进无界队列就返回，消费方异步处理，
//! 中枢从不等待接收端，接收端故障也不影响消息链路。

use tokio::sync::mpsc;
use tracing::debug;

use domain::HubEvent;

/// 审计事件接收端
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: HubEvent);
}

/// 基于无界通道的接收端，消费方拿走接收半边异步处理
pub struct ChannelAuditSink {
    sender: mpsc::UnboundedSender<HubEvent>,
}

impl ChannelAuditSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: HubEvent) {
        // 消费端关闭时丢弃事件，不影响调用方
        if self.sender.send(event).is_err() {
            debug!("审计消费端已关闭，事件被丢弃");
        }
    }
}

/// 丢弃一切事件的接收端（测试用）
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn emit(&self, _event: HubEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    use domain::{MessageId, UserId};

    #[tokio::test]
    async fn events_flow_through_channel() {
        let (sink, mut receiver) = ChannelAuditSink::new();
        sink.emit(HubEvent::MessageSent {
            message_id: MessageId::new(1),
            author_id: UserId::new(2),
        });

        let event = receiver.recv().await.unwrap();
        assert!(matches!(event, HubEvent::MessageSent { .. }));
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_is_harmless() {
        let (sink, receiver) = ChannelAuditSink::new();
        drop(receiver);
        sink.emit(HubEvent::MessageSent {
            message_id: MessageId::new(1),
            author_id: UserId::new(2),
        });
    }
}
