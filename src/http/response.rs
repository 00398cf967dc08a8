use bytes::Bytes;

/// Value of the `Server` header on every response.
pub const SERVER_NAME: &str = "Sentinel";

/// HTTP status codes the gateway emits itself.
///
/// Backend responses may carry any code in `100..=599`; those are relayed
/// numerically and never need a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 206 Partial Content
    PartialContent,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 304 Not Modified
    NotModified,
    /// 400 Bad Request
    BadRequest,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 411 Length Required
    LengthRequired,
    /// 413 Request Entity Too Large
    PayloadTooLarge,
    /// 414 Request-URI Too Long
    UriTooLong,
    /// 416 Requested Range Not Satisfiable
    RangeNotSatisfiable,
    /// 500 Internal Server Error
    InternalServerError,
    /// 501 Not Implemented
    NotImplemented,
    /// 502 Bad Gateway
    BadGateway,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// 504 Gateway Timeout
    GatewayTimeout,
}

/// Statuses that have a prebuilt error page.
pub const ERROR_STATUSES: [StatusCode; 14] = [
    StatusCode::MovedPermanently,
    StatusCode::NotModified,
    StatusCode::BadRequest,
    StatusCode::Forbidden,
    StatusCode::NotFound,
    StatusCode::LengthRequired,
    StatusCode::PayloadTooLarge,
    StatusCode::UriTooLong,
    StatusCode::RangeNotSatisfiable,
    StatusCode::InternalServerError,
    StatusCode::NotImplemented,
    StatusCode::BadGateway,
    StatusCode::ServiceUnavailable,
    StatusCode::GatewayTimeout,
];

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use sentinel_gateway::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::GatewayTimeout.as_u16(), 504);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::PartialContent => 206,
            StatusCode::MovedPermanently => 301,
            StatusCode::NotModified => 304,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::LengthRequired => 411,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::UriTooLong => 414,
            StatusCode::RangeNotSatisfiable => 416,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::BadGateway => 502,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::GatewayTimeout => 504,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use sentinel_gateway::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::PartialContent => "Partial Content",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::LengthRequired => "Length Required",
            StatusCode::PayloadTooLarge => "Request Entity Too Large",
            StatusCode::UriTooLong => "Request-URI Too Long",
            StatusCode::RangeNotSatisfiable => "Requested Range Not Satisfiable",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::GatewayTimeout => "Gateway Timeout",
        }
    }

    pub fn from_u16(code: u16) -> Option<StatusCode> {
        [StatusCode::Ok, StatusCode::PartialContent]
            .into_iter()
            .chain(ERROR_STATUSES)
            .find(|s| s.as_u16() == code)
    }
}

/// Minimal HTML bodies for error responses, rendered once at startup.
#[derive(Debug, Clone)]
pub struct ErrorPages {
    pages: Vec<(StatusCode, Bytes)>,
}

impl Default for ErrorPages {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorPages {
    pub fn new() -> Self {
        let pages = ERROR_STATUSES
            .iter()
            .map(|&status| {
                let body = if status == StatusCode::NotModified {
                    Bytes::new()
                } else {
                    Bytes::from(render(status))
                };
                (status, body)
            })
            .collect();
        Self { pages }
    }

    /// Body for `status`; shares the prebuilt page.
    pub fn get(&self, status: StatusCode) -> Bytes {
        self.pages
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, body)| body.clone())
            .unwrap_or_else(|| Bytes::from(render(status)))
    }
}

fn render(status: StatusCode) -> String {
    let reason = status.reason_phrase();
    format!(
        "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 3.2 Final//EN\">\
         <html><head><title>{reason}</title></head>\
         <body><h1>HTTP/1.1 {} {reason}</h1></body></html>",
        status.as_u16()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_status_has_a_page() {
        let pages = ErrorPages::new();
        for status in ERROR_STATUSES {
            let body = pages.get(status);
            if status == StatusCode::NotModified {
                assert!(body.is_empty());
            } else {
                let text = std::str::from_utf8(&body).unwrap();
                assert!(text.contains(&format!("HTTP/1.1 {}", status.as_u16())));
            }
        }
    }
}
