#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use hearth_host::{
    NativeExecutionContext, NativeModuleLoader, Platform, ProcessConfig, RuntimeContext,
};

pub fn config(thread_pool_size: usize) -> ProcessConfig {
    ProcessConfig {
        thread_pool_size,
        drain_timeout_ms: 500,
        ..Default::default()
    }
}

pub fn platform(thread_pool_size: usize) -> Arc<Platform> {
    Platform::new(config(thread_pool_size)).unwrap()
}

pub fn context_with(platform: Arc<Platform>, loader: NativeModuleLoader) -> RuntimeContext {
    RuntimeContext::builder(platform)
        .loader(Rc::new(loader))
        .build()
        .unwrap()
}

pub fn context() -> RuntimeContext {
    context_with(platform(2), NativeModuleLoader::new())
}

pub fn native(ctx: &RuntimeContext) -> &NativeExecutionContext {
    ctx.engine()
        .as_any()
        .downcast_ref::<NativeExecutionContext>()
        .unwrap()
}

/// Shared, clonable event log
#[derive(Clone, Default)]
pub struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}
