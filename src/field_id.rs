//! Field identifiers
//!
//! Every header field the engine can flatten, with its canonical rule-file
//! name, its default length and the protocol layer it belongs to. CoAP
//! options are additionally tied to their option number so that option
//! columns can be re-identified when a CoAP header is rebuilt.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Protocol layer a field (or a per-layer rule) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Network,
    Transport,
    Application,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::Network => "IPv6",
            Layer::Transport => "UDP",
            Layer::Application => "CoAP",
        })
    }
}

macro_rules! field_ids {
    ($( $variant:ident => $name:literal, $bits:expr, $layer:ident; )*) => {
        /// Field identifier
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum FieldId {
            $( $variant, )*
        }

        impl FieldId {
            pub const ALL: &'static [FieldId] = &[ $( FieldId::$variant, )* ];

            /// Rule-file name, e.g. `"IPV6.HOP_LMT"`.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( FieldId::$variant => $name, )*
                }
            }

            /// Default length in bits, `None` for variable-length fields.
            pub fn default_size_bits(self) -> Option<u16> {
                match self {
                    $( FieldId::$variant => $bits, )*
                }
            }

            pub fn layer(self) -> Layer {
                match self {
                    $( FieldId::$variant => Layer::$layer, )*
                }
            }
        }

        impl FromStr for FieldId {
            type Err = UnknownFieldId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $name => Ok(FieldId::$variant), )*
                    _ => Err(UnknownFieldId(s.to_string())),
                }
            }
        }
    };
}

field_ids! {
    Ipv6Ver => "IPV6.VER", Some(4), Network;
    Ipv6Tc => "IPV6.TC", Some(8), Network;
    Ipv6Fl => "IPV6.FL", Some(20), Network;
    Ipv6Len => "IPV6.LEN", Some(16), Network;
    Ipv6Nxt => "IPV6.NXT", Some(8), Network;
    Ipv6HopLmt => "IPV6.HOP_LMT", Some(8), Network;
    Ipv6DevPrefix => "IPV6.DEV_PREFIX", Some(64), Network;
    Ipv6DevIid => "IPV6.DEV_IID", Some(64), Network;
    Ipv6AppPrefix => "IPV6.APP_PREFIX", Some(64), Network;
    Ipv6AppIid => "IPV6.APP_IID", Some(64), Network;

    UdpDevPort => "UDP.DEV_PORT", Some(16), Transport;
    UdpAppPort => "UDP.APP_PORT", Some(16), Transport;
    UdpLen => "UDP.LEN", Some(16), Transport;
    UdpCksum => "UDP.CKSUM", Some(16), Transport;

    CoapVer => "COAP.VER", Some(2), Application;
    CoapType => "COAP.TYPE", Some(2), Application;
    CoapTkl => "COAP.TKL", Some(4), Application;
    CoapCode => "COAP.CODE", Some(8), Application;
    CoapMid => "COAP.MID", Some(16), Application;
    CoapToken => "COAP.TOKEN", None, Application;
    CoapIfMatch => "COAP.IF_MATCH", None, Application;
    CoapUriHost => "COAP.URI_HOST", None, Application;
    CoapEtag => "COAP.ETAG", None, Application;
    CoapIfNoneMatch => "COAP.IF_NONE_MATCH", None, Application;
    CoapObserve => "COAP.OBSERVE", None, Application;
    CoapUriPort => "COAP.URI_PORT", None, Application;
    CoapLocationPath => "COAP.LOCATION_PATH", None, Application;
    CoapUriPath => "COAP.URI_PATH", None, Application;
    CoapContentFormat => "COAP.CONTENT_FORMAT", None, Application;
    CoapMaxAge => "COAP.MAX_AGE", None, Application;
    CoapUriQuery => "COAP.URI_QUERY", None, Application;
    CoapAccept => "COAP.ACCEPT", None, Application;
    CoapLocationQuery => "COAP.LOCATION_QUERY", None, Application;
    CoapBlock2 => "COAP.BLOCK2", None, Application;
    CoapBlock1 => "COAP.BLOCK1", None, Application;
    CoapSize2 => "COAP.SIZE2", None, Application;
    CoapProxyUri => "COAP.PROXY_URI", None, Application;
    CoapProxyScheme => "COAP.PROXY_SCHEME", None, Application;
    CoapSize1 => "COAP.SIZE1", None, Application;
    CoapNoResponse => "COAP.NO_RESPONSE", None, Application;
    CoapPayloadMarker => "COAP.PAYLOAD_MARKER", Some(8), Application;
}

/// CoAP option numbers (RFC 7252, RFC 7641, RFC 7959, RFC 7967)
const COAP_OPTIONS: &[(FieldId, u16)] = &[
    (FieldId::CoapIfMatch, 1),
    (FieldId::CoapUriHost, 3),
    (FieldId::CoapEtag, 4),
    (FieldId::CoapIfNoneMatch, 5),
    (FieldId::CoapObserve, 6),
    (FieldId::CoapUriPort, 7),
    (FieldId::CoapLocationPath, 8),
    (FieldId::CoapUriPath, 11),
    (FieldId::CoapContentFormat, 12),
    (FieldId::CoapMaxAge, 14),
    (FieldId::CoapUriQuery, 15),
    (FieldId::CoapAccept, 17),
    (FieldId::CoapLocationQuery, 20),
    (FieldId::CoapBlock2, 23),
    (FieldId::CoapBlock1, 27),
    (FieldId::CoapSize2, 28),
    (FieldId::CoapProxyUri, 35),
    (FieldId::CoapProxyScheme, 39),
    (FieldId::CoapSize1, 60),
    (FieldId::CoapNoResponse, 258),
];

impl FieldId {
    /// Option number for CoAP option fields.
    pub fn coap_option_number(self) -> Option<u16> {
        COAP_OPTIONS
            .iter()
            .find(|(fid, _)| *fid == self)
            .map(|(_, number)| *number)
    }

    /// Field for a CoAP option number, if the option is known.
    pub fn from_coap_option(number: u16) -> Option<FieldId> {
        COAP_OPTIONS
            .iter()
            .find(|(_, n)| *n == number)
            .map(|(fid, _)| *fid)
    }

    pub fn is_coap_option(self) -> bool {
        self.coap_option_number().is_some()
    }
}

/// Error returned when parsing an unknown field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFieldId(pub String);

impl fmt::Display for UnknownFieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown field id: {}", self.0)
    }
}

impl std::error::Error for UnknownFieldId {}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FieldId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FieldId::from_str(&s).map_err(serde::de::Error::custom)
    }
}
