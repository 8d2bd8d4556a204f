//! Message type codes.
//!
//! The catalog is grouped by the session the message travels on. Command
//! messages start with a transaction number that the matching
//! acknowledgement or notification echoes.

/// Router notifications that may arrive on any session.
pub mod router {
    /// The server did not understand the message type we sent.
    pub const UNSUPPORTED_MESSAGE: u32 = 1;
    /// The server refused the message for security reasons.
    pub const SECURITY_FAILURE: u32 = 2;
}

/// Server-level (net session) messages, including the resource open commands
/// that are sent as the first message on a new resource session.
pub mod lgrnet {
    pub const QUERY_SERVER_CMD: u32 = 101;
    pub const QUERY_SERVER_ACK: u32 = 102;
    pub const LOGON_CMD: u32 = 103;
    pub const LOGON_ACK: u32 = 104;
    pub const LOGON_CHALLENGE_CMD: u32 = 105;
    pub const LOGON_CHALLENGE_ACK: u32 = 106;
    pub const LOGON_RESPONSE_CMD: u32 = 107;
    pub const LOGON_RESPONSE_ACK: u32 = 108;
    pub const TOKEN_LOGON_CMD: u32 = 109;
    pub const TOKEN_LOGON_ACK: u32 = 110;

    pub const OPEN_BROKER_CMD: u32 = 121;
    pub const OPEN_BROKER_ACK: u32 = 122;
    pub const OPEN_BROKER_BY_ID_CMD: u32 = 123;
    pub const OPEN_BROKER_BY_ID_ACK: u32 = 124;
    pub const BROKERS_ENUM_CMD: u32 = 125;
    pub const BROKERS_ENUM_NOT: u32 = 126;
    pub const BROKERS_ENUM_STOP_CMD: u32 = 127;

    pub const OPEN_DEVICE_CMD: u32 = 131;
    pub const OPEN_DEVICE_ACK: u32 = 132;
    pub const OPEN_DEVICE_BY_ID_CMD: u32 = 133;
    pub const OPEN_DEVICE_BY_ID_ACK: u32 = 134;
    pub const DEVICES_ENUM_CMD: u32 = 135;
    pub const DEVICES_ENUM_NOT: u32 = 136;
    pub const DEVICES_ENUM_STOP_CMD: u32 = 137;

    pub const OPEN_ROUTER_CMD: u32 = 141;
    pub const OPEN_ROUTER_ACK: u32 = 142;
    pub const OPEN_ROUTER_BY_ID_CMD: u32 = 143;
    pub const OPEN_ROUTER_BY_ID_ACK: u32 = 144;
    pub const ROUTERS_ENUM_CMD: u32 = 145;
    pub const ROUTERS_ENUM_NOT: u32 = 146;
    pub const ROUTERS_ENUM_STOP_CMD: u32 = 147;

    /// Token logon outcome: token rejected.
    pub const TOKEN_INVALID: u32 = 2;
    /// Token logon outcome: token expired.
    pub const TOKEN_EXPIRED: u32 = 3;

    /// Open outcome: no resource by that name or id.
    pub const OPEN_INVALID_NAME: u32 = 2;
    /// Open outcome: insufficient access for the resource.
    pub const OPEN_SECURITY: u32 = 3;
}

/// Data broker session messages.
pub mod broker {
    pub const TABLE_DEF_GET_CMD: u32 = 201;
    pub const TABLE_DEF_GET_ACK: u32 = 202;
    pub const DATA_ADVISE_START_CMD: u32 = 203;
    pub const DATA_ADVISE_START_ACK: u32 = 204;
    pub const DATA_ADVISE_NOT: u32 = 205;
    pub const DATA_ADVISE_CONT_CMD: u32 = 206;
    pub const DATA_ADVISE_STOP_CMD: u32 = 207;

    /// Advise outcome: table does not exist.
    pub const ADVISE_INVALID_TABLE_NAME: u32 = 2;
    /// Advise outcome: table was deleted while advising.
    pub const ADVISE_TABLE_DELETED: u32 = 3;
    /// Advise outcome: requested start position is out of range.
    pub const ADVISE_INVALID_RANGE: u32 = 4;
    /// Advise outcome: a selected column does not exist.
    pub const ADVISE_INVALID_COLUMN: u32 = 5;
}

/// Device session messages.
pub mod device {
    pub const SETTINGS_ENUM_CMD: u32 = 301;
    pub const SETTINGS_ENUM_NOT: u32 = 302;
    pub const SETTINGS_ENUM_STOP_CMD: u32 = 303;
    pub const COLLECT_AREA_CREATE_CMD: u32 = 311;
    pub const COLLECT_AREA_CREATE_ACK: u32 = 312;
    pub const COLLECT_AREA_UPDATE_CMD: u32 = 313;
    pub const COLLECT_AREA_UPDATE_ACK: u32 = 314;

    /// Settings outcome: the device type has no settings.
    pub const SETTINGS_UNSUPPORTED: u32 = 2;
    /// Collect area outcome: a field id is not valid for the device.
    pub const AREA_INVALID_FIELD: u32 = 2;
    /// Collect area outcome: the area name is already taken.
    pub const AREA_NAME_IN_USE: u32 = 3;
}

/// Setting identifiers understood by the default setting factory.
pub mod settings {
    /// Input location labels of a classic datalogger.
    pub const INPUT_LOCATION_LABELS: u32 = 52;
}
