//! Starting the daemon.

use std::sync::Arc;

use log::info;

use crate::commons::WardResult;
use crate::constants::CERTWARD_SERVER_APP;
use crate::daemon::ca::HttpCaClient;
use crate::daemon::checker::SystemProber;
use crate::daemon::config::Config;
use crate::daemon::http;
use crate::daemon::server::CertwardServer;
use crate::daemon::store::MemoryStore;

/// Wires up the production collaborators, builds the server and serves
/// the front door until a termination signal arrives.
pub async fn start_certward_daemon(config: Arc<Config>) -> WardResult<()> {
    info!(
        "{} starting, using CA at {}",
        CERTWARD_SERVER_APP, config.ca.url
    );

    let ca = Arc::new(HttpCaClient::new(
        config.ca.clone(),
        config.cert_params.clone(),
    )?);
    let store = Arc::new(MemoryStore::default());
    let prober = Arc::new(SystemProber);

    let server =
        Arc::new(CertwardServer::build(config.clone(), ca, store, prober)?);

    let addr = config.socket_addr();
    tokio::select! {
        result = http::serve(server, addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("{CERTWARD_SERVER_APP} shutting down");
            Ok(())
        }
    }
}
