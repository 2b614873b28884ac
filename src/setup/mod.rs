//! Host installation: the systemd unit that wraps `kd-agent start`.

pub mod service;
