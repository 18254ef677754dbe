/*
Device side of the platform device API.

A `Session` sends telemetry and attributes, fetches and follows attribute
values, answers server-side RPC calls and issues its own, over either an
MQTT connection or the HTTP API. Over HTTP, subscriptions are emulated by
a long-polling task per subscription.
*/

mod callbacks;
mod codec;
mod config;
mod error;
mod http;
mod mqtt;
mod session;
mod subscription;

pub use callbacks::{Callback, RpcRequestCallback};
pub use codec::AttributesQuery;
pub use config::SessionConfig;
pub use error::{Code, Error, code_of};
pub use session::{Session, Transport};
pub use subscription::{SubscriptionKind, SubscriptionState};

use thingsboard_util as util;
