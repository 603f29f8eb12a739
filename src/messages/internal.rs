use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

// Bencode has no booleans; flags travel as integers. Ids travel as raw
// byte strings and are length-checked on conversion to the public types.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "i")]
    pub id: u32,

    #[serde(rename = "y")]
    pub message_type: i32,

    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<ByteBuf>,

    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<ByteBuf>,

    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<ByteBuf>,

    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub relay_id: Option<ByteBuf>,

    #[serde(rename = "rc", default, skip_serializing_if = "Option::is_none")]
    pub relay_connection_id: Option<ByteBuf>,

    #[serde(rename = "q")]
    pub request: i32,

    #[serde(rename = "t")]
    pub direct: i32,

    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub visited: Option<i32>,

    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub client_node: Option<i32>,

    #[serde(rename = "ca", default, skip_serializing_if = "Option::is_none")]
    pub cacheable: Option<i32>,

    #[serde(rename = "p")]
    pub replication: u16,

    #[serde(rename = "h")]
    pub hops_to_live: u16,

    #[serde(rename = "g", default, skip_serializing_if = "Option::is_none")]
    pub group_claim: Option<ByteBuf>,

    #[serde(rename = "rh", default, skip_serializing_if = "Vec::is_empty")]
    pub route_history: Vec<ByteBuf>,

    #[serde(rename = "a", default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<ByteBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireBasicNodeInfo {
    #[serde(rename = "n")]
    pub node_id: ByteBuf,

    #[serde(rename = "k")]
    pub rank: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireClosestNodesUpdate {
    #[serde(rename = "n")]
    pub node: ByteBuf,

    #[serde(rename = "c")]
    pub nodes_info: Vec<WireBasicNodeInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireSubscribe {
    #[serde(rename = "p")]
    pub peer: ByteBuf,

    #[serde(rename = "s")]
    pub subscribe: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireConnect {
    #[serde(rename = "n")]
    pub node_id: ByteBuf,

    #[serde(rename = "c")]
    pub connection_id: ByteBuf,

    #[serde(rename = "nat")]
    pub nat_symmetric: i32,

    #[serde(rename = "el")]
    pub endpoint_local: String,

    #[serde(rename = "ee")]
    pub endpoint_external: String,

    #[serde(rename = "cl")]
    pub client: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireConnectSuccess {
    #[serde(rename = "n")]
    pub node_id: ByteBuf,

    #[serde(rename = "c")]
    pub connection_id: ByteBuf,

    #[serde(rename = "cl")]
    pub client: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireFindNodes {
    #[serde(rename = "t")]
    pub target: ByteBuf,

    #[serde(rename = "n")]
    pub count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireFoundNodes {
    #[serde(rename = "t")]
    pub target: ByteBuf,

    #[serde(rename = "c")]
    pub nodes: Vec<ByteBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireRemove {
    #[serde(rename = "p")]
    pub peer_id: ByteBuf,

    #[serde(rename = "f", default, skip_serializing_if = "Vec::is_empty")]
    pub furthest: Vec<ByteBuf>,
}
