#![allow(dead_code)]

use std::future::Future;
use std::rc::Rc;

use corobus_core::Bus;
use tokio::task::{JoinHandle, LocalSet};

/// Lets every ready local task run until it parks again.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn shared_bus() -> Rc<Bus> {
    Rc::new(Bus::new())
}

/// Spawns a task on the current `LocalSet` that gets its own handle to the bus.
pub fn spawn_with<F, Fut>(bus: &Rc<Bus>, task: F) -> JoinHandle<Fut::Output>
where
    F: FnOnce(Rc<Bus>) -> Fut,
    Fut: Future + 'static,
    Fut::Output: 'static,
{
    tokio::task::spawn_local(task(bus.clone()))
}

pub async fn run_local<Fut: Future>(future: Fut) -> Fut::Output {
    LocalSet::new().run_until(future).await
}
