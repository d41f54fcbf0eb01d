/*
 * imap-engine - imap
 *
 * Copyright 2017 - 2024 Manos Pitsidianakis
 *
 * This file is part of imap-engine.
 *
 * imap-engine is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * imap-engine is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with imap-engine. If not, see <http://www.gnu.org/licenses/>.
 */

//! `ENVELOPE` and `BODYSTRUCTURE` data.

use super::Value;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

impl Address {
    fn from_value(val: &Value<'_>) -> Option<Self> {
        let items = val.as_list()?;
        if items.len() < 4 {
            return None;
        }
        Some(Self {
            name: items[0].to_string_lossy(),
            // items[1] is the obsolete source route.
            mailbox: items[2].to_string_lossy(),
            host: items[3].to_string_lossy(),
        })
    }

    fn list_from_value(val: &Value<'_>) -> Vec<Self> {
        val.as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(Self::from_value)
            .collect()
    }

    /// `mailbox@host`, or whichever half is known.
    pub fn email(&self) -> String {
        match (self.mailbox.as_deref(), self.host.as_deref()) {
            (Some(m), Some(h)) => format!("{}@{}", m, h),
            (Some(m), None) => m.to_string(),
            (None, Some(h)) => h.to_string(),
            (None, None) => String::new(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => write!(fmt, "{} <{}>", name, self.email()),
            _ => write!(fmt, "{}", self.email()),
        }
    }
}

/// The parsed `ENVELOPE` fetch item.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

impl Envelope {
    pub fn from_value(val: &Value<'_>) -> Option<Self> {
        let items = val.as_list()?;
        if items.len() < 10 {
            return None;
        }
        Some(Self {
            date: items[0].to_string_lossy(),
            subject: items[1].to_string_lossy(),
            from: Address::list_from_value(&items[2]),
            sender: Address::list_from_value(&items[3]),
            reply_to: Address::list_from_value(&items[4]),
            to: Address::list_from_value(&items[5]),
            cc: Address::list_from_value(&items[6]),
            bcc: Address::list_from_value(&items[7]),
            in_reply_to: items[8].to_string_lossy(),
            message_id: items[9].to_string_lossy(),
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Disposition {
    /// Lower case, e.g. `attachment` or `inline`.
    pub kind: String,
    pub params: Vec<(String, String)>,
}

impl Disposition {
    fn from_value(val: &Value<'_>) -> Option<Self> {
        let items = val.as_list()?;
        Some(Self {
            kind: items.first()?.to_string_lossy()?.to_ascii_lowercase(),
            params: items.get(1).map(params_from_value).unwrap_or_default(),
        })
    }
}

fn params_from_value(val: &Value<'_>) -> Vec<(String, String)> {
    val.as_list()
        .unwrap_or_default()
        .chunks(2)
        .filter_map(|pair| match pair {
            [k, v] => Some((k.to_string_lossy()?.to_ascii_lowercase(), v.to_string_lossy()?)),
            _ => None,
        })
        .collect()
}

/// One node of a `BODYSTRUCTURE`.
///
/// Multipart nodes hold their parts in `children`; a `message/rfc822` node
/// holds the body of the encapsulated message as its only child.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BodyStructure {
    /// Lower case.
    pub mime_type: String,
    /// Lower case.
    pub mime_subtype: String,
    pub params: Vec<(String, String)>,
    pub id: Option<String>,
    pub description: Option<String>,
    pub encoding: Option<String>,
    pub size: Option<u32>,
    pub lines: Option<u32>,
    pub disposition: Option<Disposition>,
    pub envelope: Option<Box<Envelope>>,
    pub children: Vec<BodyStructure>,
}

impl BodyStructure {
    pub fn from_value(val: &Value<'_>) -> Option<Self> {
        let items = val.as_list()?;
        if matches!(items.first(), Some(Value::List(_))) {
            let n = items
                .iter()
                .take_while(|i| matches!(i, Value::List(_)))
                .count();
            let children = items[..n]
                .iter()
                .map(Self::from_value)
                .collect::<Option<Vec<_>>>()?;
            let ext = &items[n..];
            return Some(Self {
                mime_type: "multipart".to_string(),
                mime_subtype: ext
                    .first()
                    .and_then(Value::to_string_lossy)
                    .unwrap_or_default()
                    .to_ascii_lowercase(),
                params: ext.get(1).map(params_from_value).unwrap_or_default(),
                disposition: ext.get(2).and_then(Disposition::from_value),
                children,
                ..Self::default()
            });
        }
        if items.len() < 7 {
            return None;
        }
        let mut ret = Self {
            mime_type: items[0].to_string_lossy()?.to_ascii_lowercase(),
            mime_subtype: items[1].to_string_lossy()?.to_ascii_lowercase(),
            params: params_from_value(&items[2]),
            id: items[3].to_string_lossy(),
            description: items[4].to_string_lossy(),
            encoding: items[5].to_string_lossy(),
            size: items[6].as_u32(),
            ..Self::default()
        };
        let ext_start = if ret.is_message_rfc822() && items.len() >= 10 {
            ret.envelope = Envelope::from_value(&items[7]).map(Box::new);
            ret.children.extend(Self::from_value(&items[8]));
            ret.lines = items[9].as_u32();
            10
        } else if ret.mime_type == "text" {
            ret.lines = items.get(7).and_then(Value::as_u32);
            8
        } else {
            7
        };
        // body-ext-1part = body-fld-md5 [SP body-fld-dsp ...]
        ret.disposition = items
            .get(ext_start + 1)
            .and_then(Disposition::from_value);
        Some(ret)
    }

    pub fn is_multipart(&self) -> bool {
        self.mime_type == "multipart"
    }

    pub fn is_message_rfc822(&self) -> bool {
        self.mime_type == "message" && self.mime_subtype == "rfc822"
    }

    pub fn mime(&self) -> String {
        format!("{}/{}", self.mime_type, self.mime_subtype)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn charset(&self) -> Option<&str> {
        self.param("charset")
    }

    pub fn filename(&self) -> Option<&str> {
        self.disposition
            .as_ref()
            .and_then(|d| {
                d.params
                    .iter()
                    .find(|(k, _)| k == "filename")
                    .map(|(_, v)| v.as_str())
            })
            .or_else(|| self.param("name"))
    }
}
