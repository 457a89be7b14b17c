// 状态通知
//
// 任务每发生一次状态变更，监听器都会收到一份完整的任务快照。
// 监听器在构造编排器时注入，替代继承/方法覆盖式的扩展点。

use crate::uploader::UploadTask;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 任务状态监听器
///
/// 实现方不应在回调里做耗时操作：回调在任务锁之外、
/// 但在上传工作线程的执行路径上被同步调用
pub trait StatusListener: Send + Sync {
    /// 任务快照发生变更
    fn on_status_change(&self, task: &UploadTask);
}

/// 空监听器（不关心状态时使用）
pub struct NullStatusListener;

impl StatusListener for NullStatusListener {
    fn on_status_change(&self, _task: &UploadTask) {}
}

/// 基于无界 channel 的监听器
///
/// 把每份快照转发到 mpsc channel，便于前端/测试按序消费
pub struct ChannelStatusListener {
    tx: mpsc::UnboundedSender<UploadTask>,
}

impl ChannelStatusListener {
    /// 创建监听器和对应的接收端
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<UploadTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl StatusListener for ChannelStatusListener {
    fn on_status_change(&self, task: &UploadTask) {
        // 接收端已关闭说明没人关心了，静默丢弃
        let _ = self.tx.send(task.clone());
    }
}
