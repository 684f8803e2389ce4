use anyhow::{Context, Result};
use wasmtime::{Config, Engine};

/// Create a configured Wasmtime engine for module execution
pub fn create_engine() -> Result<Engine> {
    let mut config = Config::new();

    // Modules run synchronously on the context's owning thread
    config.async_support(false);

    // Enable optimizations for release builds
    #[cfg(not(debug_assertions))]
    {
        config.cranelift_opt_level(wasmtime::OptLevel::Speed);
    }

    Engine::new(&config).context("Failed to create Wasmtime engine")
}
