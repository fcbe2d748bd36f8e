//! Outgoing XML commands and their synchronous responses.

use std::fmt::Write as _;
use std::time::Duration;

use roxmltree::Document;
use tradelink::{SecurityKey, Side};
use zeroize::Zeroizing;

use crate::codec::{child, escape_xml, optional};
use crate::error::BrokerError;
use crate::protocol::{CommandReceipt, ServerAddress};

/// One encoded command, nul-terminated and zeroed on drop.
pub struct Command {
    kind: &'static str,
    bytes: Zeroizing<Vec<u8>>,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The nul-terminated document handed to the library.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn build(kind: &'static str, body: impl FnOnce(&mut String)) -> Self {
        let mut text = String::with_capacity(128);
        let _ = write!(text, "<command id=\"{kind}\">");
        body(&mut text);
        text.push_str("</command>");
        let mut bytes = text.into_bytes();
        bytes.push(0);
        Self {
            kind,
            bytes: Zeroizing::new(bytes),
        }
    }

    fn bare(kind: &'static str) -> Self {
        let mut bytes = format!("<command id=\"{kind}\"/>").into_bytes();
        bytes.push(0);
        Self {
            kind,
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn connect(params: &ConnectParams<'_>) -> Self {
        let server_host = params.server.host.as_bytes();
        // Sized up front so the buffer holding the password never reallocates.
        let capacity = 512 + 6 * (params.login.len() + params.password.len() + server_host.len());
        let mut bytes = Zeroizing::new(Vec::with_capacity(capacity));
        bytes.extend_from_slice(b"<command id=\"connect\">");
        push_element(&mut bytes, "login", params.login);
        push_element(&mut bytes, "password", params.password);
        push_element(&mut bytes, "host", &params.server.host);
        push_element(&mut bytes, "port", &params.server.port.to_string());
        push_element(&mut bytes, "rqdelay", &params.rqdelay.as_millis().to_string());
        push_element(&mut bytes, "session_timeout", &params.session_timeout.as_secs().to_string());
        push_element(&mut bytes, "request_timeout", &params.request_timeout.as_secs().to_string());
        push_element(&mut bytes, "milliseconds", "true");
        push_element(&mut bytes, "push_pos_equity", "1");
        bytes.extend_from_slice(b"</command>\0");
        Self {
            kind: "connect",
            bytes,
        }
    }

    pub fn disconnect() -> Self {
        Self::bare("disconnect")
    }

    pub fn server_status() -> Self {
        Self::bare("server_status")
    }

    pub fn new_order(order: &NewOrder<'_>) -> Self {
        Self::build("neworder", |text| {
            security(text, order.security);
            if let Some(client) = order.client {
                element(text, "client", client);
            }
            if let Some(union) = order.union {
                element(text, "union", union);
            }
            if !order.by_market {
                element(text, "price", order.price);
            }
            element(text, "quantity", order.quantity);
            element(text, "buysell", order.side.code());
            if order.by_market {
                text.push_str("<bymarket/>");
            }
            element(text, "unfilled", "PutInQueue");
        })
    }

    /// `quantity: None` keeps the working quantity.
    pub fn move_order(transaction_id: u64, price: &str, quantity: Option<&str>) -> Self {
        Self::build("moveorder", |text| {
            element(text, "transactionid", &transaction_id.to_string());
            element(text, "price", price);
            match quantity {
                Some(quantity) => {
                    element(text, "moveflag", "1");
                    element(text, "quantity", quantity);
                }
                None => {
                    element(text, "moveflag", "0");
                    element(text, "quantity", "0");
                }
            }
        })
    }

    pub fn cancel_order(transaction_id: u64) -> Self {
        Self::build("cancelorder", |text| {
            element(text, "transactionid", &transaction_id.to_string());
        })
    }

    pub fn subscribe_ticks(key: &SecurityKey) -> Self {
        Self::build("subscribe", |text| {
            text.push_str("<alltrades>");
            security(text, key);
            text.push_str("</alltrades>");
        })
    }

    pub fn unsubscribe_ticks(key: &SecurityKey) -> Self {
        Self::build("unsubscribe", |text| {
            text.push_str("<alltrades>");
            security(text, key);
            text.push_str("</alltrades>");
        })
    }

    pub fn history(key: &SecurityKey, period: u32, count: usize, reset: bool) -> Self {
        Self::build("gethistorydata", |text| {
            security(text, key);
            element(text, "period", &period.to_string());
            element(text, "count", &count.to_string());
            element(text, "reset", if reset { "true" } else { "false" });
        })
    }

    pub fn securities_info(market: u32, seccode: &str) -> Self {
        Self::build("get_securities_info", |text| {
            text.push_str("<security>");
            element(text, "market", &market.to_string());
            element(text, "seccode", seccode);
            text.push_str("</security>");
        })
    }

    pub fn portfolio(union: &str) -> Self {
        let mut bytes = format!(
            "<command id=\"get_mc_portfolio\" union=\"{}\" currency=\"true\" asset=\"true\" \
             money=\"true\" depo=\"true\" registers=\"false\"/>",
            escape_xml(union)
        )
        .into_bytes();
        bytes.push(0);
        Self {
            kind: "get_mc_portfolio",
            bytes: Zeroizing::new(bytes),
        }
    }
}

pub struct ConnectParams<'a> {
    pub login: &'a str,
    pub password: &'a str,
    pub server: &'a ServerAddress,
    pub rqdelay: Duration,
    pub session_timeout: Duration,
    pub request_timeout: Duration,
}

pub struct NewOrder<'a> {
    pub security: &'a SecurityKey,
    pub client: Option<&'a str>,
    pub union: Option<&'a str>,
    /// Already formatted with the security's decimals.
    pub price: &'a str,
    pub quantity: &'a str,
    pub side: Side,
    pub by_market: bool,
}

fn element(text: &mut String, name: &str, value: &str) {
    let _ = write!(text, "<{name}>{}</{name}>", escape_xml(value));
}

fn security(text: &mut String, key: &SecurityKey) {
    text.push_str("<security>");
    element(text, "board", &key.board);
    element(text, "seccode", &key.seccode);
    text.push_str("</security>");
}

/// Escapes straight into `out` so no unzeroed copy of the value is made.
fn push_element(out: &mut Vec<u8>, name: &str, value: &str) {
    out.push(b'<');
    out.extend_from_slice(name.as_bytes());
    out.push(b'>');
    for byte in value.bytes() {
        match byte {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'"' => out.extend_from_slice(b"&quot;"),
            b'\'' => out.extend_from_slice(b"&apos;"),
            other => out.push(other),
        }
    }
    out.extend_from_slice(b"</");
    out.extend_from_slice(name.as_bytes());
    out.push(b'>');
}

/// Decodes the synchronous answer to a command.
///
/// `<result success="true" transactionid=".."/>` is a receipt;
/// `success="false"` and `<error>` are broker rejections.
pub fn decode_result(raw: &str) -> Result<CommandReceipt, BrokerError> {
    let doc = Document::parse(raw)?;
    let root = doc.root_element();
    match root.tag_name().name() {
        "result" => match root.attribute("success") {
            Some("true") => Ok(CommandReceipt {
                transaction_id: optional(root, "transactionid"),
                order_no: optional::<u64>(root, "orderno").filter(|no| *no != 0),
            }),
            _ => {
                let message = child(root, "message")
                    .and_then(|m| m.text())
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .unwrap_or("command rejected");
                Err(BrokerError::Rejected(message.to_string()))
            }
        },
        "error" => Err(BrokerError::Rejected(
            root.text().map(str::trim).unwrap_or("command failed").to_string(),
        )),
        other => Err(BrokerError::Malformed(format!("unexpected command response <{other}>"))),
    }
}
