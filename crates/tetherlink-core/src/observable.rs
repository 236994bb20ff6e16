//! 观察者通道
//!
//! - [`Observable`]: 保存最新值，新订阅者立即收到当前值（last-value replay）
//! - [`EventBus`]: 不保存历史的事件广播
//!
//! 两者都按发布顺序投递，不丢弃中间值（每个订阅者一个无界队列）。
//! 订阅者的接收端被丢弃后，在下一次发布时自动移除。

use std::sync::Mutex;

use tokio::sync::mpsc;

pub struct EventBus<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn emit(&self, value: T) {
        self.lock().retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 单一权威值 + 变更通知
pub struct Observable<T> {
    inner: Mutex<ObservableInner<T>>,
}

struct ObservableInner<T> {
    value: T,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

impl<T: Clone + PartialEq> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Mutex::new(ObservableInner {
                value: initial,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// 订阅：首先收到当前值，之后按顺序收到每次变更
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // 接收端刚创建，发送不会失败
        let _ = tx.send(inner.value.clone());
        inner.subscribers.push(tx);
        rx
    }

    /// 设置新值；与当前值相同时不通知。返回是否发生变化
    pub fn set(&self, value: T) -> bool {
        let mut inner = self.lock();
        if inner.value == value {
            return false;
        }
        inner.value = value.clone();
        inner.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ObservableInner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_late_subscriber_gets_last_value() {
        let obs = Observable::new(1);
        obs.set(2);
        obs.set(3);

        let mut rx = obs.subscribe();
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_updates_delivered_in_order() {
        let obs = Observable::new(0);
        let mut rx = obs.subscribe();

        for v in 1..=5 {
            obs.set(v);
        }

        let received: Vec<i32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_unchanged_value_not_republished() {
        let obs = Observable::new("a");
        let mut rx = obs.subscribe();
        assert!(!obs.set("a"));
        assert!(obs.set("b"));

        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_bus_drops_closed_subscribers() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let mut keep = bus.subscribe();
        drop(rx);

        bus.emit(7u8);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.try_recv().unwrap(), 7);
    }
}
