fn main() {
    std::process::exit(traffic_inspector::app::run(std::env::args_os()));
}
