#[doc(hidden)]
#[macro_export]
macro_rules! assert_eq_float {
    ($a:expr, $b:expr) => {
        $crate::assert_eq_float!($a, $b, 0.00001);
    };
    ($a:expr, $b:expr, $eps:expr) => {
        assert!(($a - $b).abs() < $eps, "{} != {}", $a, $b);
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! assert_eq_float_slice {
    ($a:expr, $b:expr) => {
        $crate::assert_eq_float_slice!($a, $b, 0.00001);
    };
    ($a:expr, $b:expr, $eps:expr) => {
        let a = $a;
        let b = $b;

        assert_eq!(a.len(), b.len());
        for (a, b) in std::iter::zip(a, b) {
            $crate::assert_eq_float!(a, b, $eps);
        }
    };
}

/// Builds an image filled with a single color.
#[cfg(test)]
pub(crate) fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> image::RgbImage {
    image::RgbImage::from_pixel(width, height, image::Rgb(rgb))
}

/// Builds an image whose pixels encode their own coordinates, so every patch is distinct.
#[cfg(test)]
pub(crate) fn gradient_image(width: u32, height: u32) -> image::RgbImage {
    image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    })
}
