#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use rkv_client::{ClientConfig, ClientConfigBuilder, ProtocolVersion};
use rkv_testkit::MockServer;

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber once; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builder pointing at `servers` as masters with short deadlines.
pub fn builder_for(servers: &[&MockServer], protocol: ProtocolVersion) -> ClientConfigBuilder {
    let mut builder = ClientConfig::builder()
        .protocol(protocol)
        .connect_timeout(Duration::from_secs(2))
        .command_timeout(Duration::from_secs(2))
        .checkout_timeout(Duration::from_secs(2));
    for server in servers {
        builder = builder.master(server.endpoint());
    }
    builder
}

pub fn config_for(server: &MockServer, protocol: ProtocolVersion) -> ClientConfig {
    builder_for(&[server], protocol).build().expect("valid config")
}
