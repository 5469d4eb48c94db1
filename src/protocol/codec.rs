//! Typed marshaling between Rust values and message data points.
//!
//! Every value category implements [`WireType`] (its tag), [`Pack`] (how it is written) and
//! [`Unpack`] (how it is read back and verified). The right rules are selected at compile time
//! from the static type; the tag written next to every value lets the reader detect a peer
//! built with different expectations.
//!
//! | Rust type                           | Wire tag                                     |
//! |-------------------------------------|----------------------------------------------|
//! | `i32`, `u32`, `i64`, `u64`, `bool`   | `Int32`, `Uint32`, `Int64`, `Uint64`, `Bool`  |
//! | `String`, `str`, [`Bytes`]          | `String` (exact length, no terminator)       |
//! | [`Handle`], [`marshal_object!`] types | `Object`                                   |
//! | [`marshal_enum!`] types             | `Enum`                                       |
//! | `Vec<T>`, `[T]`                     | `Vector`, `SimpleVector` or `EmptyVector`    |
//! | `(A, B, ...)`                       | `Tuple`                                      |
//!
//! A whole message is an argument list: [`PackArgs`] writes each element of a tuple as one
//! top-level data point and [`UnpackArgs`] reads them back after checking the arity.
//!
//! [`marshal_object!`]: crate::marshal_object
//! [`marshal_enum!`]: crate::marshal_enum
use bincode::config::{Configuration, Fixint, LittleEndian};

use super::{
    DataDescriptor, DataType, DataView, Message, WireError, descriptor::DESCRIPTOR_SIZE,
};

/// Wire identity of a value category.
pub trait WireType {
    /// Tag written in front of every value of this type.
    const DATA_TYPE: DataType;

    /// Width of one element when a sequence of this type is packed flat. `None` means
    /// sequences fall back to one descriptor per element.
    const FIXED_WIDTH: Option<usize> = None;
}

pub trait Pack: WireType {
    /// Writes one descriptor (with any children) at the message cursor and returns the number
    /// of bytes written. Top-level offsets are recorded by the caller.
    fn pack(&self, msg: &mut Message) -> Result<u32, WireError>;

    /// Writes the flat element image into `out`, which is exactly `FIXED_WIDTH` bytes. Types
    /// declaring a `FIXED_WIDTH` must override it.
    fn pack_flat(&self, out: &mut [u8]) -> Result<(), WireError> {
        let _ = out;
        Err(WireError::malformed(format!(
            "{:?} value declares a fixed width but has no flat image",
            Self::DATA_TYPE
        )))
    }
}

pub trait Unpack: WireType + Sized {
    fn unpack(view: DataView<'_>) -> Result<Self, WireError>;

    /// Reads one flat element of `FIXED_WIDTH` bytes.
    fn unpack_flat(bytes: &[u8]) -> Result<Self, WireError> {
        let _ = bytes;
        Err(WireError::TypeMismatch {
            expected: Self::DATA_TYPE,
            found: DataType::SimpleVector,
        })
    }
}

impl<T: WireType + ?Sized> WireType for &T {
    const DATA_TYPE: DataType = T::DATA_TYPE;
    const FIXED_WIDTH: Option<usize> = T::FIXED_WIDTH;
}

impl<T: Pack + ?Sized> Pack for &T {
    fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
        (**self).pack(msg)
    }

    fn pack_flat(&self, out: &mut [u8]) -> Result<(), WireError> {
        (**self).pack_flat(out)
    }
}

fn exact<const N: usize>(bytes: &[u8], data_type: DataType) -> Result<[u8; N], WireError> {
    bytes.try_into().map_err(|_| {
        WireError::malformed(format!(
            "{data_type:?} payload holds {} bytes, expected {N}",
            bytes.len()
        ))
    })
}

fn accumulate(total: u32, written: u32) -> Result<u32, WireError> {
    total.checked_add(written).ok_or(WireError::TooLarge {
        size: total as usize + written as usize,
    })
}

macro_rules! scalar_impls {
    ($($ty:ty => $tag:ident, $width:expr, $wide:expr;)+) => {
        $(
            impl WireType for $ty {
                const DATA_TYPE: DataType = DataType::$tag;
                const FIXED_WIDTH: Option<usize> = Some($width);
            }

            impl Pack for $ty {
                fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
                    let descriptor = DataDescriptor::new(Self::DATA_TYPE, $width)?;
                    msg.write_data(descriptor, &self.to_le_bytes(), $wide)
                }

                fn pack_flat(&self, out: &mut [u8]) -> Result<(), WireError> {
                    out.copy_from_slice(&self.to_le_bytes());
                    Ok(())
                }
            }

            impl Unpack for $ty {
                fn unpack(view: DataView<'_>) -> Result<Self, WireError> {
                    view.expect(Self::DATA_TYPE)?;
                    Self::unpack_flat(view.payload())
                }

                fn unpack_flat(bytes: &[u8]) -> Result<Self, WireError> {
                    Ok(<$ty>::from_le_bytes(exact(bytes, Self::DATA_TYPE)?))
                }
            }
        )+
    };
}

scalar_impls! {
    i32 => Int32, 4, false;
    u32 => Uint32, 4, false;
    i64 => Int64, 8, true;
    u64 => Uint64, 8, true;
}

impl WireType for bool {
    const DATA_TYPE: DataType = DataType::Bool;
    const FIXED_WIDTH: Option<usize> = Some(1);
}

impl Pack for bool {
    fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
        msg.write_data(DataDescriptor::new(DataType::Bool, 1)?, &[*self as u8], false)
    }

    fn pack_flat(&self, out: &mut [u8]) -> Result<(), WireError> {
        out[0] = *self as u8;
        Ok(())
    }
}

impl Unpack for bool {
    fn unpack(view: DataView<'_>) -> Result<Self, WireError> {
        view.expect(DataType::Bool)?;
        Self::unpack_flat(view.payload())
    }

    fn unpack_flat(bytes: &[u8]) -> Result<Self, WireError> {
        match exact::<1>(bytes, DataType::Bool)? {
            [0] => Ok(false),
            [1] => Ok(true),
            [other] => Err(WireError::malformed(format!("invalid boolean byte {other}"))),
        }
    }
}

fn pack_string(bytes: &[u8], msg: &mut Message) -> Result<u32, WireError> {
    msg.write_data(DataDescriptor::new(DataType::String, bytes.len())?, bytes, false)
}

impl WireType for str {
    const DATA_TYPE: DataType = DataType::String;
}

impl Pack for str {
    fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
        pack_string(self.as_bytes(), msg)
    }
}

impl WireType for String {
    const DATA_TYPE: DataType = DataType::String;
}

impl Pack for String {
    fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
        pack_string(self.as_bytes(), msg)
    }
}

impl Unpack for String {
    fn unpack(view: DataView<'_>) -> Result<Self, WireError> {
        view.expect(DataType::String)?;
        String::from_utf8(view.payload().to_vec())
            .map_err(|e| WireError::malformed(format!("string payload is not UTF-8: {e}")))
    }
}

/// Raw byte string; shares the `String` tag with text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Bytes(pub Vec<u8>);

impl WireType for Bytes {
    const DATA_TYPE: DataType = DataType::String;
}

impl Pack for Bytes {
    fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
        pack_string(&self.0, msg)
    }
}

impl Unpack for Bytes {
    fn unpack(view: DataView<'_>) -> Result<Self, WireError> {
        view.expect(DataType::String)?;
        Ok(Bytes(view.payload().to_vec()))
    }
}

/// An address owned by the peer, carried as an opaque numeric identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl WireType for Handle {
    const DATA_TYPE: DataType = DataType::Object;
    const FIXED_WIDTH: Option<usize> = Some(8);
}

impl Pack for Handle {
    fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
        msg.write_data(DataDescriptor::new(DataType::Object, 8)?, &self.0.to_le_bytes(), true)
    }

    fn pack_flat(&self, out: &mut [u8]) -> Result<(), WireError> {
        out.copy_from_slice(&self.0.to_le_bytes());
        Ok(())
    }
}

impl Unpack for Handle {
    fn unpack(view: DataView<'_>) -> Result<Self, WireError> {
        view.expect(DataType::Object)?;
        Self::unpack_flat(view.payload())
    }

    fn unpack_flat(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(Handle(u64::from_le_bytes(exact(bytes, DataType::Object)?)))
    }
}

fn object_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Writes a plain aggregate as an `Object`: a fixed-int image of its fields.
pub fn pack_object<T: bincode::Encode>(value: &T, msg: &mut Message) -> Result<u32, WireError> {
    let image = bincode::encode_to_vec(value, object_config())?;
    msg.write_data(DataDescriptor::new(DataType::Object, image.len())?, &image, false)
}

pub fn unpack_object<T: bincode::Decode<()>>(view: DataView<'_>) -> Result<T, WireError> {
    view.expect(DataType::Object)?;
    let (value, read) = bincode::decode_from_slice(view.payload(), object_config())?;
    if read != view.payload().len() {
        return Err(WireError::malformed(format!(
            "object image holds {} bytes, {read} decoded",
            view.payload().len()
        )));
    }
    Ok(value)
}

pub fn pack_enum(raw: u32, msg: &mut Message) -> Result<u32, WireError> {
    msg.write_data(DataDescriptor::new(DataType::Enum, 4)?, &raw.to_le_bytes(), false)
}

pub fn unpack_enum(view: DataView<'_>) -> Result<u32, WireError> {
    view.expect(DataType::Enum)?;
    Ok(u32::from_le_bytes(exact(view.payload(), DataType::Enum)?))
}

/// Marshals a plain aggregate deriving `bincode::Encode` and `bincode::Decode` as an `Object`.
#[macro_export]
macro_rules! marshal_object {
    ($ty:ty) => {
        impl $crate::protocol::WireType for $ty {
            const DATA_TYPE: $crate::protocol::DataType = $crate::protocol::DataType::Object;
        }

        impl $crate::protocol::Pack for $ty {
            fn pack(
                &self,
                msg: &mut $crate::protocol::Message,
            ) -> ::std::result::Result<u32, $crate::protocol::WireError> {
                $crate::protocol::pack_object(self, msg)
            }
        }

        impl $crate::protocol::Unpack for $ty {
            fn unpack(
                view: $crate::protocol::DataView<'_>,
            ) -> ::std::result::Result<Self, $crate::protocol::WireError> {
                $crate::protocol::unpack_object(view)
            }
        }
    };
}

/// Marshals a fieldless enum as an `Enum`. The type must be `Copy`, convert into `u32`, and
/// implement `TryFrom<u32>`.
#[macro_export]
macro_rules! marshal_enum {
    ($ty:ty) => {
        impl $crate::protocol::WireType for $ty {
            const DATA_TYPE: $crate::protocol::DataType = $crate::protocol::DataType::Enum;
        }

        impl $crate::protocol::Pack for $ty {
            fn pack(
                &self,
                msg: &mut $crate::protocol::Message,
            ) -> ::std::result::Result<u32, $crate::protocol::WireError> {
                $crate::protocol::pack_enum(u32::from(*self), msg)
            }
        }

        impl $crate::protocol::Unpack for $ty {
            fn unpack(
                view: $crate::protocol::DataView<'_>,
            ) -> ::std::result::Result<Self, $crate::protocol::WireError> {
                let raw = $crate::protocol::unpack_enum(view)?;
                <$ty as ::std::convert::TryFrom<u32>>::try_from(raw).map_err(|_| {
                    $crate::protocol::WireError::Malformed {
                        reason: format!("{raw} is not a valid {}", stringify!($ty)),
                    }
                })
            }
        }
    };
}

impl<T: WireType> WireType for [T] {
    const DATA_TYPE: DataType = DataType::Vector;
}

impl<T: Pack> Pack for [T] {
    fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
        if self.is_empty() {
            return msg.write_data(DataDescriptor::new(DataType::EmptyVector, 0)?, &[], false);
        }

        match T::FIXED_WIDTH {
            Some(width) if width <= u8::MAX as usize => {
                let len = width
                    .checked_mul(self.len())
                    .ok_or(WireError::TooLarge { size: usize::MAX })?;
                let descriptor = DataDescriptor::new(DataType::SimpleVector, len)?
                    .with_element_size(width as u8);
                msg.write_data_with(descriptor, width == 8, |out| {
                    for (element, chunk) in self.iter().zip(out.chunks_exact_mut(width)) {
                        element.pack_flat(chunk)?;
                    }
                    Ok(())
                })
            }
            _ => {
                let count = u32::try_from(self.len())
                    .map_err(|_| WireError::TooLarge { size: self.len() })?;
                msg.atomically(|msg| {
                    let slot = msg.reserve_descriptor_slot()?;
                    let mut written = count.pack(msg)?;
                    for element in self {
                        written = accumulate(written, element.pack(msg)?)?;
                    }
                    let descriptor = DataDescriptor::compound(DataType::Vector, written);
                    msg.patch_descriptor(slot, descriptor)?;
                    accumulate(written, DESCRIPTOR_SIZE as u32)
                })
            }
        }
    }
}

impl<T: WireType> WireType for Vec<T> {
    const DATA_TYPE: DataType = DataType::Vector;
}

impl<T: Pack> Pack for Vec<T> {
    fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
        self.as_slice().pack(msg)
    }
}

impl<T: Unpack> Unpack for Vec<T> {
    fn unpack(view: DataView<'_>) -> Result<Self, WireError> {
        match view.data_type() {
            DataType::EmptyVector => Ok(Vec::new()),
            DataType::SimpleVector => {
                let width = view.descriptor().element_size as usize;
                if width == 0 || T::FIXED_WIDTH != Some(width) {
                    return Err(WireError::TypeMismatch {
                        expected: T::DATA_TYPE,
                        found: DataType::SimpleVector,
                    });
                }
                let payload = view.payload();
                if payload.len() % width != 0 {
                    return Err(WireError::malformed(format!(
                        "flat sequence of {} bytes is not a multiple of {width}",
                        payload.len()
                    )));
                }
                payload.chunks_exact(width).map(T::unpack_flat).collect()
            }
            DataType::Vector => {
                let mut children = view.children();
                let count = u32::unpack(next_child(&mut children)?)? as usize;
                // The count comes off the wire; never reserve more than the payload can hold.
                let mut out = Vec::with_capacity(count.min(view.payload().len() / DESCRIPTOR_SIZE));
                for _ in 0..count {
                    out.push(T::unpack(next_child(&mut children)?)?);
                }
                if children.next().is_some() {
                    return Err(WireError::malformed(format!(
                        "sequence declares {count} elements but carries more"
                    )));
                }
                Ok(out)
            }
            found => Err(WireError::TypeMismatch {
                expected: DataType::Vector,
                found,
            }),
        }
    }
}

fn next_child<'a>(
    children: &mut impl Iterator<Item = Result<DataView<'a>, WireError>>,
) -> Result<DataView<'a>, WireError> {
    children
        .next()
        .unwrap_or_else(|| Err(WireError::malformed("compound value ended early")))
}

/// A list of values written as consecutive top-level data points.
pub trait PackArgs {
    const ARITY: usize;

    fn pack_args(&self, msg: &mut Message) -> Result<(), WireError>;
}

/// A list of values read back from the top-level data points of a message.
pub trait UnpackArgs: Sized {
    const ARITY: usize;

    /// Reads the values from data points `first..`, which must be the last ones in `msg`.
    fn unpack_args_at(msg: &Message, first: usize) -> Result<Self, WireError>;

    fn unpack_args(msg: &Message) -> Result<Self, WireError> {
        Self::unpack_args_at(msg, 0)
    }
}

fn check_arity(msg: &Message, first: usize, expected: usize) -> Result<(), WireError> {
    if msg.count() != first + expected {
        return Err(WireError::ArityMismatch {
            expected,
            found: msg.count().saturating_sub(first),
        });
    }
    Ok(())
}

impl PackArgs for () {
    const ARITY: usize = 0;

    fn pack_args(&self, _msg: &mut Message) -> Result<(), WireError> {
        Ok(())
    }
}

impl UnpackArgs for () {
    const ARITY: usize = 0;

    fn unpack_args_at(msg: &Message, first: usize) -> Result<Self, WireError> {
        check_arity(msg, first, 0)
    }
}

macro_rules! tuple_impls {
    ($($arity:literal => ($($name:ident . $idx:tt),+);)+) => {
        $(
            impl<$($name: WireType),+> WireType for ($($name,)+) {
                const DATA_TYPE: DataType = DataType::Tuple;
            }

            impl<$($name: Pack),+> Pack for ($($name,)+) {
                fn pack(&self, msg: &mut Message) -> Result<u32, WireError> {
                    msg.atomically(|msg| {
                        let slot = msg.reserve_descriptor_slot()?;
                        let mut written = 0;
                        $( written = accumulate(written, self.$idx.pack(msg)?)?; )+
                        let descriptor = DataDescriptor::compound(DataType::Tuple, written);
                        msg.patch_descriptor(slot, descriptor)?;
                        accumulate(written, DESCRIPTOR_SIZE as u32)
                    })
                }
            }

            impl<$($name: Unpack),+> Unpack for ($($name,)+) {
                fn unpack(view: DataView<'_>) -> Result<Self, WireError> {
                    view.expect(DataType::Tuple)?;
                    let found = view.children().count();
                    if found != $arity {
                        return Err(WireError::ArityMismatch { expected: $arity, found });
                    }
                    let mut children = view.children();
                    Ok(($( $name::unpack(next_child(&mut children)?)?, )+))
                }
            }

            impl<$($name: Pack),+> PackArgs for ($($name,)+) {
                const ARITY: usize = $arity;

                fn pack_args(&self, msg: &mut Message) -> Result<(), WireError> {
                    $( msg.push(&self.$idx)?; )+
                    Ok(())
                }
            }

            impl<$($name: Unpack),+> UnpackArgs for ($($name,)+) {
                const ARITY: usize = $arity;

                fn unpack_args_at(msg: &Message, first: usize) -> Result<Self, WireError> {
                    check_arity(msg, first, $arity)?;
                    Ok(($( $name::unpack(msg.data_point(first + $idx)?)?, )+))
                }
            }
        )+
    };
}

tuple_impls! {
    1 => (A.0);
    2 => (A.0, B.1);
    3 => (A.0, B.1, C.2);
    4 => (A.0, B.1, C.2, D.3);
    5 => (A.0, B.1, C.2, D.3, E.4);
    6 => (A.0, B.1, C.2, D.3, E.4, F.5);
    7 => (A.0, B.1, C.2, D.3, E.4, F.5, G.6);
    8 => (A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7);
}

/// Appends `args` to `msg`, one top-level data point per value. On failure none of them are
/// kept.
pub fn pack<A: PackArgs>(msg: &mut Message, args: A) -> Result<(), WireError> {
    msg.atomically(|msg| args.pack_args(msg))
}

/// Reads every top-level data point of `msg` as the values of `A`.
pub fn unpack<A: UnpackArgs>(msg: &Message) -> Result<A, WireError> {
    A::unpack_args(msg)
}
