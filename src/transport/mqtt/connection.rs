//! Pure connection setup for the rumqttc transport
//!
//! Option building, QoS conversion and error classification. Nothing here
//! touches the network.

use crate::config::SessionConfig;
use crate::protocol::codec;
use crate::protocol::{DevicePayload, QoS, TopicBuilder};
use crate::transport::TransportError;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, LastWill};
use rumqttc::v5::mqttbytes::QoS as MqttQoS;
use rumqttc::v5::{ConnectionError, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use url::Url;

/// Largest packet we accept from or send to the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

pub fn uses_tls(scheme: &str) -> bool {
    matches!(scheme, "mqtts" | "ssl")
}

/// Build rumqttc options from a session configuration
///
/// The client id is used verbatim so persistent sessions survive reconnects.
pub fn configure_mqtt_options(config: &SessionConfig) -> Result<MqttOptions, TransportError> {
    let url = Url::parse(&config.broker_url).map_err(|e| {
        TransportError::InvalidConfiguration(format!("broker_url '{}': {e}", config.broker_url))
    })?;
    let host = url.host_str().ok_or_else(|| {
        TransportError::InvalidConfiguration(format!(
            "broker_url '{}' has no host",
            config.broker_url
        ))
    })?;
    let tls = uses_tls(url.scheme());
    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

    let mut options = MqttOptions::new(config.client_id.clone(), host, port);
    if tls {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    let credentials = config
        .credentials()
        .map_err(|e| TransportError::InvalidConfiguration(e.to_string()))?;
    if let Some(credentials) = credentials {
        options.set_credentials(credentials.username, credentials.password);
    }

    options.set_keep_alive(config.keep_alive());
    options.set_clean_start(config.clean_session);
    options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(presence) = &config.presence {
        let topic = TopicBuilder::status_topic(&presence.device_id);
        let payload = codec::encode(&DevicePayload::Status {
            online: false,
            detail: Some("connection lost".to_string()),
        });
        options.set_last_will(LastWill::new(
            topic,
            payload.to_vec(),
            MqttQoS::AtLeastOnce,
            true,
            None,
        ));
    }

    Ok(options)
}

pub fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}

pub fn from_mqtt_qos(qos: MqttQoS) -> QoS {
    match qos {
        MqttQoS::AtMostOnce => QoS::AtMostOnce,
        MqttQoS::AtLeastOnce => QoS::AtLeastOnce,
        MqttQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Map an event loop failure onto the transport's error vocabulary
pub fn classify_connection_error(error: &ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => TransportError::AuthenticationFailed(format!("broker refused credentials: {code:?}")),
        ConnectionError::ConnectionRefused(code @ ConnectReturnCode::ClientIdentifierNotValid) => {
            TransportError::InvalidConfiguration(format!("broker rejected client id: {code:?}"))
        }
        ConnectionError::ConnectionRefused(code) => {
            TransportError::Unreachable(format!("broker refused connection: {code:?}"))
        }
        other => TransportError::Unreachable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialsSection, PresenceSection};
    use std::time::Duration;

    #[test]
    fn test_configure_plain_broker() {
        let mut config = SessionConfig::new("mqtt://broker.local", "display-7");
        config.keep_alive_secs = 15;

        let options = configure_mqtt_options(&config).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.client_id(), "display-7");
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert!(!options.clean_start());
        assert!(options.last_will().is_none());
    }

    #[test]
    fn test_configure_tls_default_port() {
        let config = SessionConfig::new("mqtts://broker.local", "display-7");
        let options = configure_mqtt_options(&config).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));

        let config = SessionConfig::new("ssl://broker.local:9999", "display-7");
        let options = configure_mqtt_options(&config).unwrap();
        assert_eq!(options.broker_address().1, 9999);
    }

    #[test]
    fn test_configure_rejects_bad_url() {
        let config = SessionConfig::new("not a url", "display-7");
        assert!(matches!(
            configure_mqtt_options(&config),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_missing_credentials_are_invalid_configuration() {
        let mut config = SessionConfig::new("mqtt://broker.local", "display-7");
        config.credentials = Some(CredentialsSection {
            username_env: "DEVLINK_TEST_CONNECTION_UNSET_USER".to_string(),
            password_env: None,
        });

        let err = configure_mqtt_options(&config).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("DEVLINK_TEST_CONNECTION_UNSET_USER"));
    }

    #[test]
    fn test_presence_installs_last_will() {
        let mut config = SessionConfig::new("mqtt://broker.local", "display-7");
        config.presence = Some(PresenceSection::new("display-7"));

        let options = configure_mqtt_options(&config).unwrap();
        let will = options.last_will().expect("last will configured");
        assert_eq!(will.topic, "device/display-7/status");
        assert!(will.retain);
        assert_eq!(
            codec::decode(&will.message).unwrap(),
            DevicePayload::Status {
                online: false,
                detail: Some("connection lost".to_string()),
            }
        );
    }

    #[test]
    fn test_qos_conversion() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(from_mqtt_qos(to_mqtt_qos(qos)), qos);
        }
    }

    #[test]
    fn test_classify_connection_error() {
        let auth = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert!(matches!(
            classify_connection_error(&auth),
            TransportError::AuthenticationFailed(_)
        ));

        let busy = ConnectionError::ConnectionRefused(ConnectReturnCode::ServerBusy);
        let classified = classify_connection_error(&busy);
        assert!(matches!(classified, TransportError::Unreachable(_)));
        assert!(!classified.is_fatal());
    }
}
