pub const DEFAULT_NAMESPACE: &str = "smartpill";

pub fn status_topic(namespace: &str) -> String {
    format!("{namespace}/status")
}

pub fn command_topic(namespace: &str) -> String {
    format!("{namespace}/command")
}

pub fn availability_topic(namespace: &str) -> String {
    format!("{namespace}/availability")
}

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";
