// Publication: effect routing, the sinks they land in and the worker that applies them.

pub mod dispatcher;
pub mod history_csv;
pub mod router;
pub mod sinks;
