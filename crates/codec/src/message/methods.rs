use crate::Error;

/// STUN Methods Registry
///
/// [RFC5389]: https://datatracker.ietf.org/doc/html/rfc5389
/// [RFC8126]: https://datatracker.ietf.org/doc/html/rfc8126
///
/// A STUN method is a hex number in the range 0x000-0x0FF.  STUN methods
/// in the range 0x000-0x07F are assigned by IETF Review [RFC8126].
///
/// 0x000: Reserved
/// 0x001: Binding
/// 0x002: Reserved; was SharedSecret prior to [RFC5389]
/// 0x003: Allocate
/// 0x004: Refresh
/// 0x006: Send
/// 0x007: Data
/// 0x008: CreatePermission
/// 0x009: ChannelBind
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum MethodType {
    Request,
    Response,
    Error,
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Method {
    Binding(MethodType),
    Allocate(MethodType),
    CreatePermission(MethodType),
    ChannelBind(MethodType),
    Refresh(MethodType),
    SendIndication,
    DataIndication,
}

impl Method {
    /// The class of the method, if it is not an indication.
    pub fn class(&self) -> Option<MethodType> {
        match self {
            Self::Binding(t)
            | Self::Allocate(t)
            | Self::CreatePermission(t)
            | Self::ChannelBind(t)
            | Self::Refresh(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.class() == Some(MethodType::Request)
    }

    /// Whether the method is a success or error response.
    pub fn is_response(&self) -> bool {
        matches!(self.class(), Some(MethodType::Response) | Some(MethodType::Error))
    }

    pub fn is_error(&self) -> bool {
        self.class() == Some(MethodType::Error)
    }

    /// Whether two methods share the same base method, regardless of
    /// class.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::methods::*;
    ///
    /// let request = Method::Allocate(MethodType::Request);
    ///
    /// assert!(request.same_method(&Method::Allocate(MethodType::Response)));
    /// assert!(request.same_method(&Method::Allocate(MethodType::Error)));
    /// assert!(!request.same_method(&Method::Binding(MethodType::Response)));
    /// assert!(!request.same_method(&Method::DataIndication));
    /// ```
    pub fn same_method(&self, other: &Method) -> bool {
        matches!(
            (self, other),
            (Self::Binding(_), Self::Binding(_))
                | (Self::Allocate(_), Self::Allocate(_))
                | (Self::CreatePermission(_), Self::CreatePermission(_))
                | (Self::ChannelBind(_), Self::ChannelBind(_))
                | (Self::Refresh(_), Self::Refresh(_))
                | (Self::SendIndication, Self::SendIndication)
                | (Self::DataIndication, Self::DataIndication)
        )
    }
}

impl TryFrom<u16> for Method {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::methods::*;
    ///
    /// assert_eq!(
    ///     Method::try_from(0x0001).unwrap(),
    ///     Method::Binding(MethodType::Request)
    /// );
    /// assert_eq!(
    ///     Method::try_from(0x0101).unwrap(),
    ///     Method::Binding(MethodType::Response)
    /// );
    /// assert_eq!(
    ///     Method::try_from(0x0111).unwrap(),
    ///     Method::Binding(MethodType::Error)
    /// );
    /// assert_eq!(
    ///     Method::try_from(0x0003).unwrap(),
    ///     Method::Allocate(MethodType::Request)
    /// );
    /// assert_eq!(Method::try_from(0x0016).unwrap(), Method::SendIndication);
    /// assert_eq!(Method::try_from(0x0017).unwrap(), Method::DataIndication);
    /// assert!(Method::try_from(0x0002).is_err());
    /// ```
    fn try_from(value: u16) -> Result<Self, Error> {
        Ok(match value {
            0x0001 => Self::Binding(MethodType::Request),
            0x0101 => Self::Binding(MethodType::Response),
            0x0111 => Self::Binding(MethodType::Error),
            0x0003 => Self::Allocate(MethodType::Request),
            0x0103 => Self::Allocate(MethodType::Response),
            0x0113 => Self::Allocate(MethodType::Error),
            0x0008 => Self::CreatePermission(MethodType::Request),
            0x0108 => Self::CreatePermission(MethodType::Response),
            0x0118 => Self::CreatePermission(MethodType::Error),
            0x0009 => Self::ChannelBind(MethodType::Request),
            0x0109 => Self::ChannelBind(MethodType::Response),
            0x0119 => Self::ChannelBind(MethodType::Error),
            0x0004 => Self::Refresh(MethodType::Request),
            0x0104 => Self::Refresh(MethodType::Response),
            0x0114 => Self::Refresh(MethodType::Error),
            0x0016 => Self::SendIndication,
            0x0017 => Self::DataIndication,
            _ => return Err(Error::UnknownMethod),
        })
    }
}

impl From<Method> for u16 {
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::methods::*;
    ///
    /// assert_eq!(0x0001u16, Method::Binding(MethodType::Request).into());
    /// assert_eq!(0x0103u16, Method::Allocate(MethodType::Response).into());
    /// assert_eq!(0x0114u16, Method::Refresh(MethodType::Error).into());
    /// assert_eq!(0x0016u16, Method::SendIndication.into());
    /// ```
    fn from(val: Method) -> Self {
        match val {
            Method::Binding(MethodType::Request) => 0x0001,
            Method::Binding(MethodType::Response) => 0x0101,
            Method::Binding(MethodType::Error) => 0x0111,
            Method::Allocate(MethodType::Request) => 0x0003,
            Method::Allocate(MethodType::Response) => 0x0103,
            Method::Allocate(MethodType::Error) => 0x0113,
            Method::CreatePermission(MethodType::Request) => 0x0008,
            Method::CreatePermission(MethodType::Response) => 0x0108,
            Method::CreatePermission(MethodType::Error) => 0x0118,
            Method::ChannelBind(MethodType::Request) => 0x0009,
            Method::ChannelBind(MethodType::Response) => 0x0109,
            Method::ChannelBind(MethodType::Error) => 0x0119,
            Method::Refresh(MethodType::Request) => 0x0004,
            Method::Refresh(MethodType::Response) => 0x0104,
            Method::Refresh(MethodType::Error) => 0x0114,
            Method::SendIndication => 0x0016,
            Method::DataIndication => 0x0017,
        }
    }
}
