// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Header names shared between the gateway and the executor.

/// Object key of the function source, `deployments/{deployment_id}/{resource_path}`.
pub const X_FUNCTION_PATH: &str = "x-function-path";

/// Deployment that owns the function.
pub const X_DEPLOYMENT_ID: &str = "x-deployment-id";

/// Project that owns the deployment.
pub const X_PROJECT_ID: &str = "x-project-id";

/// Original `Host` of the inbound request.
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Tells nginx-style intermediaries not to buffer streamed responses.
pub const X_ACCEL_BUFFERING: &str = "x-accel-buffering";
