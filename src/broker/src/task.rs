// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task spawning.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawns a named task onto the runtime. The name decorates the task's
/// tracing output so the background loops stay attributable in logs.
pub fn spawn<N, F>(name: N, future: F) -> JoinHandle<F::Output>
where
    N: FnOnce() -> &'static str,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name();
    tokio::spawn(future.instrument(tracing::info_span!("task", name = name)))
}
