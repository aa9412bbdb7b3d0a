//! Meshtastic protobuf messages
//!
//! The subset of the Meshtastic protobuf schema that the client core speaks, expressed as
//! `prost` derives. Field numbers follow the upstream `meshtastic/*.proto` definitions so
//! frames are byte-compatible with radio firmware; fields the core never touches are
//! omitted and skipped as unknown fields on decode.
//!
//! Naming mirrors what `prost-build` emits: messages at the top level, oneofs and nested
//! enums inside a snake_case module named after the parent message.
#![allow(clippy::derive_partial_eq_without_eq)]

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Packets/commands sent from the phone to the radio (written to the ToRadio characteristic).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: ::core::option::Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        /// Ask the radio to stream its node database and config, terminated by a
        /// `FromRadio.config_complete_id` carrying the same value.
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

/// Everything the radio hands back to the phone (read from the FromRadio characteristic).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 5, 7, 8, 9, 10, 13")]
    pub payload_variant: ::core::option::Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        #[prost(message, tag = "5")]
        Config(super::Config),
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
        #[prost(bool, tag = "8")]
        Rebooted(bool),
        #[prost(message, tag = "9")]
        ModuleConfig(super::ModuleConfig),
        #[prost(message, tag = "10")]
        Channel(super::Channel),
        #[prost(message, tag = "13")]
        Metadata(super::DeviceMetadata),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(uint32, tag = "1")]
    pub nonce: u32,
}

// ---------------------------------------------------------------------------
// Mesh packets
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(enumeration = "mesh_packet::Priority", tag = "11")]
    pub priority: i32,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: ::core::option::Option<mesh_packet::PayloadVariant>,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes = "bytes", tag = "5")]
        Encrypted(::prost::bytes::Bytes),
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Priority {
        Unset = 0,
        Min = 1,
        Background = 10,
        Default = 64,
        Reliable = 70,
        Ack = 120,
        Max = 127,
    }
}

/// Application payload carried inside a decoded [`MeshPacket`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: ::prost::bytes::Bytes,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    TextMessageCompressedApp = 7,
    WaypointApp = 8,
    AudioApp = 9,
    ReplyApp = 32,
    IpTunnelApp = 33,
    SerialApp = 64,
    StoreForwardApp = 65,
    RangeTestApp = 66,
    TelemetryApp = 67,
    ZpsApp = 68,
    SimulatorApp = 69,
    TracerouteApp = 70,
    PrivateApp = 256,
    AtakForwarder = 257,
    Max = 511,
}

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
    #[prost(bool, tag = "2")]
    pub has_gps: bool,
    #[prost(uint32, tag = "3")]
    pub max_channels: u32,
    #[prost(string, tag = "4")]
    pub firmware_version: ::prost::alloc::string::String,
    #[prost(uint32, tag = "8")]
    pub reboot_count: u32,
    #[prost(uint32, tag = "11")]
    pub min_app_version: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: ::core::option::Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: ::core::option::Option<Position>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
    #[prost(message, optional, tag = "6")]
    pub device_metrics: ::core::option::Option<DeviceMetrics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub long_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub short_name: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "4")]
    pub macaddr: ::prost::bytes::Bytes,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    #[prost(sfixed32, tag = "1")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "2")]
    pub longitude_i: i32,
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(int32, tag = "5")]
    pub location_source: i32,
    #[prost(fixed32, tag = "7")]
    pub timestamp: u32,
    #[prost(uint32, tag = "15")]
    pub ground_speed: u32,
    #[prost(uint32, tag = "16")]
    pub ground_track: u32,
    #[prost(uint32, tag = "19")]
    pub sats_in_view: u32,
    #[prost(uint32, tag = "22")]
    pub seq_number: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Waypoint {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(sfixed32, tag = "2")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "3")]
    pub longitude_i: i32,
    #[prost(uint32, tag = "4")]
    pub expire: u32,
    #[prost(uint32, tag = "5")]
    pub locked_to: u32,
    #[prost(string, tag = "6")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub description: ::prost::alloc::string::String,
    #[prost(fixed32, tag = "8")]
    pub icon: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceMetadata {
    #[prost(string, tag = "1")]
    pub firmware_version: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub device_state_version: u32,
    #[prost(bool, tag = "3")]
    pub can_shutdown: bool,
    #[prost(bool, tag = "4")]
    pub has_wifi: bool,
    #[prost(bool, tag = "5")]
    pub has_bluetooth: bool,
    #[prost(bool, tag = "6")]
    pub has_ethernet: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
    #[prost(uint32, tag = "8")]
    pub position_flags: u32,
    #[prost(int32, tag = "9")]
    pub hw_model: i32,
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteDiscovery {
    #[prost(fixed32, repeated, tag = "1")]
    pub route: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Routing {
    #[prost(oneof = "routing::Variant", tags = "1, 2, 3")]
    pub variant: ::core::option::Option<routing::Variant>,
}

pub mod routing {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "1")]
        RouteRequest(super::RouteDiscovery),
        #[prost(message, tag = "2")]
        RouteReply(super::RouteDiscovery),
        #[prost(enumeration = "Error", tag = "3")]
        ErrorReason(i32),
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Error {
        None = 0,
        NoRoute = 1,
        GotNak = 2,
        Timeout = 3,
        NoInterface = 4,
        MaxRetransmit = 5,
        NoChannel = 6,
        TooLarge = 7,
        NoResponse = 8,
        DutyCycleLimit = 9,
        BadRequest = 32,
        NotAuthorized = 33,
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceMetrics {
    #[prost(uint32, tag = "1")]
    pub battery_level: u32,
    #[prost(float, tag = "2")]
    pub voltage: f32,
    #[prost(float, tag = "3")]
    pub channel_utilization: f32,
    #[prost(float, tag = "4")]
    pub air_util_tx: f32,
    #[prost(uint32, tag = "5")]
    pub uptime_seconds: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvironmentMetrics {
    #[prost(float, tag = "1")]
    pub temperature: f32,
    #[prost(float, tag = "2")]
    pub relative_humidity: f32,
    #[prost(float, tag = "3")]
    pub barometric_pressure: f32,
    #[prost(float, tag = "4")]
    pub gas_resistance: f32,
    #[prost(float, tag = "5")]
    pub voltage: f32,
    #[prost(float, tag = "6")]
    pub current: f32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2, 3")]
    pub variant: ::core::option::Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelSettings {
    #[prost(uint32, tag = "1")]
    pub channel_num: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub psk: ::prost::bytes::Bytes,
    #[prost(string, tag = "3")]
    pub name: ::prost::alloc::string::String,
    #[prost(fixed32, tag = "4")]
    pub id: u32,
    #[prost(bool, tag = "5")]
    pub uplink_enabled: bool,
    #[prost(bool, tag = "6")]
    pub downlink_enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Channel {
    #[prost(int32, tag = "1")]
    pub index: i32,
    #[prost(message, optional, tag = "2")]
    pub settings: ::core::option::Option<ChannelSettings>,
    #[prost(enumeration = "channel::Role", tag = "3")]
    pub role: i32,
}

pub mod channel {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Role {
        Disabled = 0,
        Primary = 1,
        Secondary = 2,
    }
}

/// The payload of a shareable channel URL.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelSet {
    #[prost(message, repeated, tag = "1")]
    pub settings: ::prost::alloc::vec::Vec<ChannelSettings>,
    #[prost(message, optional, tag = "2")]
    pub lora_config: ::core::option::Option<config::LoRaConfig>,
}

// ---------------------------------------------------------------------------
// Device config
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Config {
    #[prost(oneof = "config::PayloadVariant", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub payload_variant: ::core::option::Option<config::PayloadVariant>,
}

pub mod config {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Device(DeviceConfig),
        #[prost(message, tag = "2")]
        Position(PositionConfig),
        #[prost(message, tag = "3")]
        Power(PowerConfig),
        #[prost(message, tag = "4")]
        Network(NetworkConfig),
        #[prost(message, tag = "5")]
        Display(DisplayConfig),
        #[prost(message, tag = "6")]
        Lora(LoRaConfig),
        #[prost(message, tag = "7")]
        Bluetooth(BluetoothConfig),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeviceConfig {
        #[prost(int32, tag = "1")]
        pub role: i32,
        #[prost(bool, tag = "2")]
        pub serial_enabled: bool,
        #[prost(bool, tag = "3")]
        pub debug_log_enabled: bool,
        #[prost(uint32, tag = "4")]
        pub button_gpio: u32,
        #[prost(uint32, tag = "5")]
        pub buzzer_gpio: u32,
        #[prost(int32, tag = "6")]
        pub rebroadcast_mode: i32,
        #[prost(uint32, tag = "7")]
        pub node_info_broadcast_secs: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PositionConfig {
        #[prost(uint32, tag = "1")]
        pub position_broadcast_secs: u32,
        #[prost(bool, tag = "2")]
        pub position_broadcast_smart_enabled: bool,
        #[prost(bool, tag = "3")]
        pub fixed_position: bool,
        #[prost(bool, tag = "4")]
        pub gps_enabled: bool,
        #[prost(uint32, tag = "5")]
        pub gps_update_interval: u32,
        #[prost(uint32, tag = "6")]
        pub gps_attempt_time: u32,
        #[prost(uint32, tag = "7")]
        pub position_flags: u32,
        #[prost(uint32, tag = "8")]
        pub rx_gpio: u32,
        #[prost(uint32, tag = "9")]
        pub tx_gpio: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PowerConfig {
        #[prost(bool, tag = "1")]
        pub is_power_saving: bool,
        #[prost(uint32, tag = "2")]
        pub on_battery_shutdown_after_secs: u32,
        #[prost(float, tag = "3")]
        pub adc_multiplier_override: f32,
        #[prost(uint32, tag = "4")]
        pub wait_bluetooth_secs: u32,
        #[prost(uint32, tag = "5")]
        pub mesh_sds_timeout_secs: u32,
        #[prost(uint32, tag = "6")]
        pub sds_secs: u32,
        #[prost(uint32, tag = "7")]
        pub ls_secs: u32,
        #[prost(uint32, tag = "8")]
        pub min_wake_secs: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NetworkConfig {
        #[prost(bool, tag = "1")]
        pub wifi_enabled: bool,
        #[prost(string, tag = "3")]
        pub wifi_ssid: ::prost::alloc::string::String,
        #[prost(string, tag = "4")]
        pub wifi_psk: ::prost::alloc::string::String,
        #[prost(string, tag = "5")]
        pub ntp_server: ::prost::alloc::string::String,
        #[prost(bool, tag = "6")]
        pub eth_enabled: bool,
        #[prost(int32, tag = "7")]
        pub address_mode: i32,
        #[prost(string, tag = "9")]
        pub rsyslog_server: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DisplayConfig {
        #[prost(uint32, tag = "1")]
        pub screen_on_secs: u32,
        #[prost(int32, tag = "2")]
        pub gps_format: i32,
        #[prost(uint32, tag = "3")]
        pub auto_screen_carousel_secs: u32,
        #[prost(bool, tag = "4")]
        pub compass_north_top: bool,
        #[prost(bool, tag = "5")]
        pub flip_screen: bool,
        #[prost(int32, tag = "6")]
        pub units: i32,
        #[prost(int32, tag = "7")]
        pub oled: i32,
        #[prost(int32, tag = "8")]
        pub displaymode: i32,
        #[prost(bool, tag = "9")]
        pub heading_bold: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LoRaConfig {
        #[prost(bool, tag = "1")]
        pub use_preset: bool,
        #[prost(int32, tag = "2")]
        pub modem_preset: i32,
        #[prost(uint32, tag = "3")]
        pub bandwidth: u32,
        #[prost(uint32, tag = "4")]
        pub spread_factor: u32,
        #[prost(uint32, tag = "5")]
        pub coding_rate: u32,
        #[prost(float, tag = "6")]
        pub frequency_offset: f32,
        #[prost(int32, tag = "7")]
        pub region: i32,
        #[prost(uint32, tag = "8")]
        pub hop_limit: u32,
        #[prost(bool, tag = "9")]
        pub tx_enabled: bool,
        #[prost(int32, tag = "10")]
        pub tx_power: i32,
        #[prost(uint32, tag = "11")]
        pub channel_num: u32,
        #[prost(bool, tag = "12")]
        pub override_duty_cycle: bool,
        #[prost(bool, tag = "13")]
        pub sx126x_rx_boosted_gain: bool,
        #[prost(float, tag = "14")]
        pub override_frequency: f32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BluetoothConfig {
        #[prost(bool, tag = "1")]
        pub enabled: bool,
        #[prost(int32, tag = "2")]
        pub mode: i32,
        #[prost(uint32, tag = "3")]
        pub fixed_pin: u32,
    }
}

// ---------------------------------------------------------------------------
// Module config
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModuleConfig {
    #[prost(oneof = "module_config::PayloadVariant", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub payload_variant: ::core::option::Option<module_config::PayloadVariant>,
}

pub mod module_config {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Mqtt(MqttConfig),
        #[prost(message, tag = "2")]
        Serial(SerialConfig),
        #[prost(message, tag = "3")]
        ExternalNotification(ExternalNotificationConfig),
        #[prost(message, tag = "4")]
        StoreForward(StoreForwardConfig),
        #[prost(message, tag = "5")]
        RangeTest(RangeTestConfig),
        #[prost(message, tag = "6")]
        Telemetry(TelemetryConfig),
        #[prost(message, tag = "7")]
        CannedMessage(CannedMessageConfig),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MqttConfig {
        #[prost(bool, tag = "1")]
        pub enabled: bool,
        #[prost(string, tag = "2")]
        pub address: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub username: ::prost::alloc::string::String,
        #[prost(string, tag = "4")]
        pub password: ::prost::alloc::string::String,
        #[prost(bool, tag = "5")]
        pub encryption_enabled: bool,
        #[prost(bool, tag = "6")]
        pub json_enabled: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SerialConfig {
        #[prost(bool, tag = "1")]
        pub enabled: bool,
        #[prost(bool, tag = "2")]
        pub echo: bool,
        #[prost(uint32, tag = "3")]
        pub rxd: u32,
        #[prost(uint32, tag = "4")]
        pub txd: u32,
        #[prost(int32, tag = "5")]
        pub baud: i32,
        #[prost(uint32, tag = "6")]
        pub timeout: u32,
        #[prost(int32, tag = "7")]
        pub mode: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ExternalNotificationConfig {
        #[prost(bool, tag = "1")]
        pub enabled: bool,
        #[prost(uint32, tag = "2")]
        pub output_ms: u32,
        #[prost(uint32, tag = "3")]
        pub output: u32,
        #[prost(bool, tag = "4")]
        pub active: bool,
        #[prost(bool, tag = "5")]
        pub alert_message: bool,
        #[prost(bool, tag = "6")]
        pub alert_bell: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StoreForwardConfig {
        #[prost(bool, tag = "1")]
        pub enabled: bool,
        #[prost(bool, tag = "2")]
        pub heartbeat: bool,
        #[prost(uint32, tag = "3")]
        pub records: u32,
        #[prost(uint32, tag = "4")]
        pub history_return_max: u32,
        #[prost(uint32, tag = "5")]
        pub history_return_window: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RangeTestConfig {
        #[prost(bool, tag = "1")]
        pub enabled: bool,
        #[prost(uint32, tag = "2")]
        pub sender: u32,
        #[prost(bool, tag = "3")]
        pub save: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TelemetryConfig {
        #[prost(uint32, tag = "1")]
        pub device_update_interval: u32,
        #[prost(uint32, tag = "2")]
        pub environment_update_interval: u32,
        #[prost(bool, tag = "3")]
        pub environment_measurement_enabled: bool,
        #[prost(bool, tag = "4")]
        pub environment_screen_enabled: bool,
        #[prost(bool, tag = "5")]
        pub environment_display_fahrenheit: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CannedMessageConfig {
        #[prost(bool, tag = "1")]
        pub rotary1_enabled: bool,
        #[prost(uint32, tag = "2")]
        pub inputbroker_pin_a: u32,
        #[prost(uint32, tag = "3")]
        pub inputbroker_pin_b: u32,
        #[prost(uint32, tag = "4")]
        pub inputbroker_pin_press: u32,
        #[prost(bool, tag = "8")]
        pub updown1_enabled: bool,
        #[prost(bool, tag = "9")]
        pub enabled: bool,
        #[prost(string, tag = "10")]
        pub allow_input_source: ::prost::alloc::string::String,
        #[prost(bool, tag = "11")]
        pub send_bell: bool,
    }
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

/// Control-plane message carried on [`PortNum::AdminApp`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminMessage {
    #[prost(
        oneof = "admin_message::PayloadVariant",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 13, 32, 33, 34, 35, 36, 97, 98, 99, 100"
    )]
    pub payload_variant: ::core::option::Option<admin_message::PayloadVariant>,
}

pub mod admin_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(uint32, tag = "1")]
        GetChannelRequest(u32),
        #[prost(message, tag = "2")]
        GetChannelResponse(super::Channel),
        #[prost(bool, tag = "3")]
        GetOwnerRequest(bool),
        #[prost(message, tag = "4")]
        GetOwnerResponse(super::User),
        #[prost(enumeration = "ConfigType", tag = "5")]
        GetConfigRequest(i32),
        #[prost(message, tag = "6")]
        GetConfigResponse(super::Config),
        #[prost(enumeration = "ModuleConfigType", tag = "7")]
        GetModuleConfigRequest(i32),
        #[prost(message, tag = "8")]
        GetModuleConfigResponse(super::ModuleConfig),
        #[prost(bool, tag = "10")]
        GetCannedMessageModuleMessagesRequest(bool),
        #[prost(string, tag = "11")]
        GetCannedMessageModuleMessagesResponse(::prost::alloc::string::String),
        #[prost(bool, tag = "12")]
        GetDeviceMetadataRequest(bool),
        #[prost(message, tag = "13")]
        GetDeviceMetadataResponse(super::DeviceMetadata),
        #[prost(message, tag = "32")]
        SetOwner(super::User),
        #[prost(message, tag = "33")]
        SetChannel(super::Channel),
        #[prost(message, tag = "34")]
        SetConfig(super::Config),
        #[prost(message, tag = "35")]
        SetModuleConfig(super::ModuleConfig),
        #[prost(string, tag = "36")]
        SetCannedMessageModuleMessages(::prost::alloc::string::String),
        #[prost(int32, tag = "97")]
        RebootSeconds(i32),
        #[prost(int32, tag = "98")]
        ShutdownSeconds(i32),
        #[prost(int32, tag = "99")]
        FactoryReset(i32),
        #[prost(int32, tag = "100")]
        NodedbReset(i32),
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ConfigType {
        DeviceConfig = 0,
        PositionConfig = 1,
        PowerConfig = 2,
        NetworkConfig = 3,
        DisplayConfig = 4,
        LoraConfig = 5,
        BluetoothConfig = 6,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ModuleConfigType {
        MqttConfig = 0,
        SerialConfig = 1,
        ExtnotifConfig = 2,
        StoreforwardConfig = 3,
        RangetestConfig = 4,
        TelemetryConfig = 5,
        CannedmsgConfig = 6,
    }
}
