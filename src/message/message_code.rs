use std::fmt::{Debug, Display, Formatter};

/// The 8-bit code from the CoAP header, split into a 3-bit class and a 5-bit detail. Class 0 holds
///  the request methods (and EMPTY at 0.00), classes 2, 4 and 5 hold response codes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageCode(pub u8);

impl MessageCode {
    pub const EMPTY: MessageCode = MessageCode(0);

    pub const GET: MessageCode = MessageCode(1);
    pub const POST: MessageCode = MessageCode(2);
    pub const PUT: MessageCode = MessageCode(3);
    pub const DELETE: MessageCode = MessageCode(4);

    pub const CREATED_201: MessageCode = MessageCode::new(2, 1);
    pub const DELETED_202: MessageCode = MessageCode::new(2, 2);
    pub const VALID_203: MessageCode = MessageCode::new(2, 3);
    pub const CHANGED_204: MessageCode = MessageCode::new(2, 4);
    pub const CONTENT_205: MessageCode = MessageCode::new(2, 5);
    pub const CONTINUE_231: MessageCode = MessageCode::new(2, 31);

    pub const BAD_REQUEST_400: MessageCode = MessageCode::new(4, 0);
    pub const UNAUTHORIZED_401: MessageCode = MessageCode::new(4, 1);
    pub const BAD_OPTION_402: MessageCode = MessageCode::new(4, 2);
    pub const FORBIDDEN_403: MessageCode = MessageCode::new(4, 3);
    pub const NOT_FOUND_404: MessageCode = MessageCode::new(4, 4);
    pub const METHOD_NOT_ALLOWED_405: MessageCode = MessageCode::new(4, 5);
    pub const NOT_ACCEPTABLE_406: MessageCode = MessageCode::new(4, 6);
    pub const REQUEST_ENTITY_INCOMPLETE_408: MessageCode = MessageCode::new(4, 8);
    pub const PRECONDITION_FAILED_412: MessageCode = MessageCode::new(4, 12);
    pub const REQUEST_ENTITY_TOO_LARGE_413: MessageCode = MessageCode::new(4, 13);
    pub const UNSUPPORTED_CONTENT_FORMAT_415: MessageCode = MessageCode::new(4, 15);

    pub const INTERNAL_SERVER_ERROR_500: MessageCode = MessageCode::new(5, 0);
    pub const NOT_IMPLEMENTED_501: MessageCode = MessageCode::new(5, 1);
    pub const BAD_GATEWAY_502: MessageCode = MessageCode::new(5, 2);
    pub const SERVICE_UNAVAILABLE_503: MessageCode = MessageCode::new(5, 3);
    pub const GATEWAY_TIMEOUT_504: MessageCode = MessageCode::new(5, 4);
    pub const PROXYING_NOT_SUPPORTED_505: MessageCode = MessageCode::new(5, 5);

    pub const fn new(class: u8, detail: u8) -> MessageCode {
        MessageCode((class << 5) | (detail & 0x1f))
    }

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// NB: codes 0.05 to 0.31 are reserved for future methods, we treat them as requests so that
    ///  the option decoding policy for requests applies to them
    pub fn is_request(&self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    pub fn is_response(&self) -> bool {
        self.class() >= 2
    }

    pub fn is_error(&self) -> bool {
        self.class() >= 4
    }
}

impl Display for MessageCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl Debug for MessageCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            MessageCode::EMPTY => "EMPTY",
            MessageCode::GET => "GET",
            MessageCode::POST => "POST",
            MessageCode::PUT => "PUT",
            MessageCode::DELETE => "DELETE",
            _ => return write!(f, "{}", self),
        };
        write!(f, "{}", name)
    }
}
