// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The broker daemon: HTTP surface and server lifecycle.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use strand_broker::Broker;

pub mod http;

/// Starts the broker's election loops and serves its HTTP surface on `addr`
/// until the process exits.
pub async fn serve(addr: SocketAddr, broker: Arc<Broker>) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(addr).with_context(|| format!("binding {}", addr))?;
    serve_listener(listener, broker).await
}

/// Like [`serve`], but over a listener the caller already bound. Tests bind
/// port 0 and read the assigned address back before calling this.
pub async fn serve_listener(listener: TcpListener, broker: Arc<Broker>) -> Result<(), anyhow::Error> {
    listener
        .set_nonblocking(true)
        .context("setting listener nonblocking")?;
    broker.start();
    info!(
        "{}: serving on {}",
        broker.broker_id(),
        listener.local_addr().context("reading listener address")?
    );
    axum::Server::from_tcp(listener)
        .context("constructing server")?
        .serve(http::router(broker).into_make_service())
        .await
        .context("serving HTTP")?;
    Ok(())
}
