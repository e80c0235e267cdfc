//! Outbound job-outcome notifications.

mod backoff;
mod dispatcher;
mod payload;

pub use backoff::RetryPolicy;
pub use dispatcher::{
    sign_body, DeliveryReport, DeliveryState, DispatcherSettings, WebhookDispatcher,
    SIGNATURE_HEADER,
};
pub use payload::WebhookPayload;
