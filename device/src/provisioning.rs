//! Network settings exchanged with the local configuration portal.

use serde::{Deserialize, Serialize};

use pillbox_common::NetworkConfig;

#[derive(Debug, PartialEq, Serialize)]
pub struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfigUpdate {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: Option<String>,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser", default)]
    mqtt_user: String,
    #[serde(rename = "mqttPass", default)]
    mqtt_pass: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NetworkUpdateResponse {
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
    pub network: NetworkConfigView,
}

pub fn build_network_config_view(network: &NetworkConfig) -> NetworkConfigView {
    NetworkConfigView {
        wifi_ssid: network.wifi_ssid.clone(),
        wifi_pass_set: !network.wifi_pass.is_empty(),
        mqtt_host: network.mqtt_host.clone(),
        mqtt_port: network.mqtt_port,
        mqtt_user: network.mqtt_user.clone(),
        mqtt_pass_set: !network.mqtt_pass.is_empty(),
    }
}

/// Omitted passwords keep their stored value.
pub fn apply_network_update(previous: &NetworkConfig, update: NetworkConfigUpdate) -> NetworkConfig {
    NetworkConfig {
        wifi_ssid: update.wifi_ssid.trim().to_string(),
        wifi_pass: update.wifi_pass.unwrap_or_else(|| previous.wifi_pass.clone()),
        mqtt_host: update.mqtt_host.trim().to_string(),
        mqtt_port: update.mqtt_port,
        mqtt_user: update.mqtt_user,
        mqtt_pass: update.mqtt_pass.unwrap_or_else(|| previous.mqtt_pass.clone()),
    }
}

/// The link manager picks up wifi changes live; the broker client is only
/// built at startup.
pub fn broker_restart_required(previous: &NetworkConfig, current: &NetworkConfig) -> bool {
    previous.mqtt_host != current.mqtt_host
        || previous.mqtt_port != current.mqtt_port
        || previous.mqtt_user != current.mqtt_user
        || previous.mqtt_pass != current.mqtt_pass
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn stored() -> NetworkConfig {
        NetworkConfig {
            wifi_ssid: "home".to_string(),
            wifi_pass: "correct-horse".to_string(),
            mqtt_host: "broker.local".to_string(),
            mqtt_port: 1883,
            mqtt_user: "pill".to_string(),
            mqtt_pass: "broker-secret".to_string(),
        }
    }

    fn update(json: &str) -> NetworkConfigUpdate {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn omitted_passwords_are_kept() {
        let next = apply_network_update(
            &stored(),
            update(r#"{"wifiSsid":" cabin ","mqttHost":"broker.local","mqttPort":1883,"mqttUser":"pill"}"#),
        );

        assert_eq!(next.wifi_ssid, "cabin");
        assert_eq!(next.wifi_pass, "correct-horse");
        assert_eq!(next.mqtt_pass, "broker-secret");
        assert!(!broker_restart_required(&stored(), &next));
    }

    #[test]
    fn broker_change_needs_restart() {
        let next = apply_network_update(
            &stored(),
            update(r#"{"wifiSsid":"home","mqttHost":"10.0.0.2","mqttPort":8883,"mqttUser":"pill","mqttPass":""}"#),
        );

        assert!(broker_restart_required(&stored(), &next));
        assert_eq!(next.mqtt_pass, "");
    }

    #[test]
    fn updated_settings_still_go_through_validation() {
        let next = apply_network_update(
            &stored(),
            update(r#"{"wifiSsid":"CHANGE_ME","mqttHost":"broker.local","mqttPort":1883}"#),
        );

        assert!(next.validate().is_err());
    }

    #[test]
    fn view_hides_secrets() {
        let view = serde_json::to_value(build_network_config_view(&stored())).unwrap();

        assert_eq!(
            view,
            serde_json::json!({
                "wifiSsid": "home",
                "wifiPassSet": true,
                "mqttHost": "broker.local",
                "mqttPort": 1883,
                "mqttUser": "pill",
                "mqttPassSet": true,
            })
        );
    }
}
