use bytes::Bytes;

use crate::error::Error;
use crate::h1::error::ProtoError;

/// One part of a `multipart/form-data` body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Decoded form body: urlencoded fields and/or multipart parts.
#[derive(Clone, Debug, Default)]
pub struct FormData {
    fields: Vec<(String, String)>,
    parts: Vec<Part>,
}

impl FormData {
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// First field value for `name`, searching urlencoded fields and named
    /// multipart parts alike.
    pub fn value(&self, name: &str) -> Option<&str> {
        if let Some((_, v)) = self.fields.iter().find(|(k, _)| k == name) {
            return Some(v);
        }
        self.parts
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .and_then(|p| std::str::from_utf8(&p.data).ok())
    }

    pub(crate) fn from_urlencoded(body: &[u8]) -> Result<Self, Error> {
        let fields: Vec<(String, String)> =
            serde_urlencoded::from_bytes(body).map_err(|_| Error::Proto(ProtoError::HeaderValue))?;
        Ok(Self {
            fields,
            parts: Vec::new(),
        })
    }

    /// Split a `multipart/form-data` body on its boundary and pull the
    /// `Content-Disposition` name/filename out of each part.
    pub(crate) fn from_multipart(body: &[u8], boundary: &str) -> Result<Self, Error> {
        let delimiter = format!("--{boundary}");
        let mut form = Self::default();

        let body = std::str::from_utf8(body).map_err(|_| Error::Proto(ProtoError::HeaderValue))?;

        for raw in body.split(delimiter.as_str()) {
            let raw = raw.strip_prefix("\r\n").unwrap_or(raw);
            if raw.is_empty() || raw == "--" || raw == "--\r\n" {
                continue;
            }

            let Some((head, data)) = raw.split_once("\r\n\r\n") else {
                continue;
            };
            let data = data.strip_suffix("\r\n").unwrap_or(data);

            let mut part = Part {
                name: None,
                filename: None,
                content_type: None,
                data: Bytes::copy_from_slice(data.as_bytes()),
            };

            for line in head.split("\r\n") {
                let Some((name, value)) = line.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                if name.eq_ignore_ascii_case("content-type") {
                    part.content_type = Some(value.to_owned());
                } else if name.eq_ignore_ascii_case("content-disposition") {
                    for attr in value.split(';').skip(1) {
                        let Some((key, val)) = attr.split_once('=') else {
                            continue;
                        };
                        let val = val.trim().trim_matches('"').to_owned();
                        match key.trim() {
                            "name" => part.name = Some(val),
                            "filename" => part.filename = Some(val),
                            _ => {}
                        }
                    }
                }
            }

            form.parts.push(part);
        }

        Ok(form)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn urlencoded_fields() {
        let form = FormData::from_urlencoded(b"name=izzy&tag=a+b&tag=c").unwrap();
        assert_eq!(form.value("name"), Some("izzy"));
        assert_eq!(form.value("tag"), Some("a b"));
        assert_eq!(form.fields().len(), 3);
    }

    #[test]
    fn multipart_parts() {
        let body = b"--xYzZY\r\n\
            Content-Disposition: form-data; name=\"field1\"\r\n\r\n\
            value1\r\n\
            --xYzZY\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            file contents\r\n\
            --xYzZY--\r\n";

        let form = FormData::from_multipart(body, "xYzZY").unwrap();
        assert_eq!(form.parts().len(), 2);
        assert_eq!(form.value("field1"), Some("value1"));

        let upload = &form.parts()[1];
        assert_eq!(upload.name.as_deref(), Some("upload"));
        assert_eq!(upload.filename.as_deref(), Some("a.txt"));
        assert_eq!(upload.content_type.as_deref(), Some("text/plain"));
        assert_eq!(&upload.data[..], b"file contents");
    }
}
