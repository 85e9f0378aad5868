/// Pixel-wise image comparison
use super::CompareOutcome;

pub fn image_compare(expected: &[u8], actual: &[u8]) -> CompareOutcome {
    let expected = match image::load_from_memory(expected) {
        Ok(img) => img.to_rgba8(),
        Err(e) => return CompareOutcome::failed(format!("Cannot decode expected image: {}", e)),
    };
    let actual = match image::load_from_memory(actual) {
        Ok(img) => img.to_rgba8(),
        Err(e) => return CompareOutcome::failed(format!("Cannot decode output image: {}", e)),
    };

    if expected.dimensions() != actual.dimensions() {
        let (ew, eh) = expected.dimensions();
        let (aw, ah) = actual.dimensions();
        return CompareOutcome::failed(format!(
            "Image dimensions differ: expected {}x{}, got {}x{}",
            ew, eh, aw, ah
        ));
    }

    let differing = expected
        .pixels()
        .zip(actual.pixels())
        .filter(|(e, a)| e != a)
        .count();
    if differing == 0 {
        CompareOutcome::passed()
    } else {
        let total = expected.width() as usize * expected.height() as usize;
        CompareOutcome::failed(format!("{} of {} pixels differ", differing, total))
    }
}
