use rand::Rng;
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;



#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn gen_u16() -> u16;
    fn gen_f64_range(range: Range<f64>) -> f64;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_u16() -> u16 {
        rand::thread_rng().gen()
    }

    fn gen_f64_range(range: Range<f64>) -> f64 {
        if range.is_empty() {
            return range.start;
        }
        rand::thread_rng().gen_range(range)
    }
}
