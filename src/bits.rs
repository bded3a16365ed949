//! Typed bitset declarations shared by the mask types.
//!
//! Every mask in the crate is a transparent integer newtype with named
//! flags, set algebra and a `|`-joined textual form.

macro_rules! bitset {
   (
      $(#[$meta:meta])*
      $vis:vis struct $name:ident($repr:ty) {
         $( $(#[$fmeta:meta])* const $flag:ident = $value:expr, $label:literal; )*
      }
   ) => {
      $(#[$meta])*
      #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, ::serde::Serialize, ::serde::Deserialize)]
      #[repr(transparent)]
      $vis struct $name($repr);

      impl $name {
         $( $(#[$fmeta])* pub const $flag: Self = Self($value); )*

         const NAMES: &'static [(Self, &'static str)] = &[ $( (Self::$flag, $label), )* ];

         pub const fn empty() -> Self {
            Self(0)
         }

         pub const fn from_bits(bits: $repr) -> Self {
            Self(bits)
         }

         pub const fn bits(self) -> $repr {
            self.0
         }

         pub const fn is_empty(self) -> bool {
            self.0 == 0
         }

         pub const fn contains(self, other: Self) -> bool {
            self.0 & other.0 == other.0
         }

         pub const fn intersects(self, other: Self) -> bool {
            self.0 & other.0 != 0
         }

         pub const fn union(self, other: Self) -> Self {
            Self(self.0 | other.0)
         }

         pub const fn intersection(self, other: Self) -> Self {
            Self(self.0 & other.0)
         }

         pub const fn difference(self, other: Self) -> Self {
            Self(self.0 & !other.0)
         }

         pub fn insert(&mut self, other: Self) {
            self.0 |= other.0;
         }

         pub fn remove(&mut self, other: Self) {
            self.0 &= !other.0;
         }

         pub fn set(&mut self, other: Self, on: bool) {
            if on {
               self.insert(other);
            } else {
               self.remove(other);
            }
         }

         /// Names of the known flags present in this set.
         pub fn names(self) -> impl Iterator<Item = &'static str> {
            Self::NAMES
               .iter()
               .filter(move |(flag, _)| !flag.is_empty() && self.contains(*flag))
               .map(|(_, name)| *name)
         }

         /// Looks up a single flag by its textual name.
         pub fn from_name(name: &str) -> Option<Self> {
            Self::NAMES
               .iter()
               .find(|(_, n)| n.eq_ignore_ascii_case(name))
               .map(|(flag, _)| *flag)
         }

         fn known_bits() -> $repr {
            Self::NAMES.iter().fold(0, |acc, (flag, _)| acc | flag.0)
         }
      }

      impl ::std::ops::BitOr for $name {
         type Output = Self;
         fn bitor(self, rhs: Self) -> Self {
            self.union(rhs)
         }
      }

      impl ::std::ops::BitOrAssign for $name {
         fn bitor_assign(&mut self, rhs: Self) {
            self.insert(rhs);
         }
      }

      impl ::std::ops::BitAnd for $name {
         type Output = Self;
         fn bitand(self, rhs: Self) -> Self {
            self.intersection(rhs)
         }
      }

      impl ::std::ops::BitAndAssign for $name {
         fn bitand_assign(&mut self, rhs: Self) {
            self.0 &= rhs.0;
         }
      }

      impl ::std::ops::Sub for $name {
         type Output = Self;
         fn sub(self, rhs: Self) -> Self {
            self.difference(rhs)
         }
      }

      impl ::std::ops::SubAssign for $name {
         fn sub_assign(&mut self, rhs: Self) {
            self.remove(rhs);
         }
      }

      impl ::std::fmt::Display for $name {
         fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
            if self.is_empty() {
               return f.write_str("none");
            }
            let mut first = true;
            for name in self.names() {
               if !first {
                  f.write_str("|")?;
               }
               f.write_str(name)?;
               first = false;
            }
            let unknown = self.0 & !Self::known_bits();
            if unknown != 0 {
               if !first {
                  f.write_str("|")?;
               }
               write!(f, "{unknown:#x}")?;
            }
            Ok(())
         }
      }

      impl ::std::fmt::Debug for $name {
         fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
            write!(f, "{}({self})", stringify!($name))
         }
      }

      impl ::std::str::FromStr for $name {
         type Err = ::strum::ParseError;

         fn from_str(s: &str) -> Result<Self, Self::Err> {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("none") {
               return Ok(Self::empty());
            }
            let mut out = Self::empty();
            for part in s.split('|') {
               let part = part.trim();
               let flag = if let Some(hex) = part.strip_prefix("0x") {
                  <$repr>::from_str_radix(hex, 16)
                     .map(Self)
                     .map_err(|_| ::strum::ParseError::VariantNotFound)?
               } else {
                  Self::from_name(part).ok_or(::strum::ParseError::VariantNotFound)?
               };
               out.insert(flag);
            }
            Ok(out)
         }
      }
   };
}

pub(crate) use bitset;
