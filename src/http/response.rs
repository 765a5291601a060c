/// HTTP status codes the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 101 Switching Protocols
    SwitchingProtocols,
    /// 200 OK
    Ok,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 404 Not Found
    NotFound,
    /// 500 Internal Server Error
    InternalServerError,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// ```
    /// # use rpcmux::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::MovedPermanently.as_u16(), 301);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::SwitchingProtocols => 101,
            StatusCode::Ok => 200,
            StatusCode::MovedPermanently => 301,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::NotFound => 404,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::SwitchingProtocols => "Switching Protocols",
            StatusCode::Ok => "OK",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// An HTTP response ready to be serialized.
///
/// Headers are serialized in insertion order.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Adds a header, replacing an earlier one with the same name.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key, value)),
        }
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Builds the final Response, appending `Content-Length` unless present.
    /// 101 responses never carry a body length.
    pub fn build(mut self) -> Response {
        let has_length = self
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("Content-Length"));
        if !has_length && self.status != StatusCode::SwitchingProtocols {
            self.headers
                .push(("Content-Length".to_string(), self.body.len().to_string()));
        }

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

const XML_PROLOG: &str = "<?xml version=\"1.0\"?>";

impl Response {
    /// Case-insensitive header lookup.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// 200 reply carrying an encoded RPC payload.
    ///
    /// Header order is `Connection`, `Content-Type`, `Content-Length`. XML
    /// payloads get the XML prolog in front; every payload is CRLF-terminated.
    pub fn rpc(content_type: &str, payload: &[u8], keep_alive: bool) -> Self {
        let mut body = Vec::with_capacity(payload.len() + XML_PROLOG.len() + 2);
        if content_type == "text/xml" {
            body.extend_from_slice(XML_PROLOG.as_bytes());
        }
        body.extend_from_slice(payload);
        body.extend_from_slice(b"\r\n");

        ResponseBuilder::new(StatusCode::Ok)
            .header("Connection", if keep_alive { "Keep-Alive" } else { "close" })
            .header("Content-Type", content_type)
            .body(body)
            .build()
    }

    pub fn bad_request() -> Self {
        Self::error_page(StatusCode::BadRequest, "Your client sent a request that this server could not understand.")
    }

    pub fn not_found() -> Self {
        Self::error_page(StatusCode::NotFound, "The requested resource was not found on this server.")
    }

    pub fn internal_error() -> Self {
        Self::error_page(StatusCode::InternalServerError, "The server could not complete the request.")
    }

    pub fn unauthorized(realm: &str) -> Self {
        let mut response = Self::error_page(StatusCode::Unauthorized, "Authentication is required.");
        response
            .headers
            .insert(0, ("WWW-Authenticate".to_string(), format!("Basic realm=\"{}\"", realm)));
        response
    }

    /// 301 pointing at `location`.
    pub fn redirect(location: &str) -> Self {
        let text = format!("The document has moved <a href=\"{}\">here</a>.", location);
        let mut response = Self::error_page(StatusCode::MovedPermanently, &text);
        response
            .headers
            .insert(0, ("Location".to_string(), location.to_string()));
        response
    }

    fn error_page(status: StatusCode, text: &str) -> Self {
        let title = format!("{} {}", status.as_u16(), status.reason_phrase());
        let body = format!(
            "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\"><html><head><title>{title}</title></head><body><h1>{title}</h1><p>{text}</p></body></html>"
        );
        ResponseBuilder::new(status)
            .header("Connection", "close")
            .header("Content-Type", "text/html; charset=UTF-8")
            .body(body.into_bytes())
            .build()
    }
}
